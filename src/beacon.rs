//! SSDP discovery beacon.
//!
//! One [`SsdpBeacon`] serves every device of the process: SSDP listens on a
//! single well-known port, so devices register [`BeaconEntry`] values with it
//! instead of each opening their own socket. The beacon announces entries with
//! `NOTIFY ssdp:alive`, answers `M-SEARCH` requests, and sends
//! `NOTIFY ssdp:byebye` when an entry is withdrawn.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

use crate::device_manager::DeviceIdentity;
use crate::error::Result;
use crate::http::{HttpServer, DEVICE_TYPE};

/// SSDP multicast group.
pub const SSDP_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);

/// SSDP port.
pub const SSDP_PORT: u16 = 1900;

/// `max-age` announced in `CACHE-CONTROL`, in seconds.
pub const MAX_AGE_SECS: u64 = 1800;

/// Interval between unsolicited re-announcements.
pub const NOTIFY_INTERVAL: Duration = Duration::from_secs(MAX_AGE_SECS / 2);

/// Upper bound on the `MX` response delay we honour.
const MAX_MX_SECS: u64 = 5;

const ROOT_DEVICE: &str = "upnp:rootdevice";

/// What the beacon announces for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeaconEntry {
    /// `uuid:` plus the normalized hardware address.
    pub udn: String,
    /// Device type URN.
    pub service_type: String,
    /// URL of the description document.
    pub location: String,
}

impl BeaconEntry {
    /// Entry for a device whose HTTP adapter is already bound.
    ///
    /// Taking the bound server enforces that nothing is advertised before the
    /// advertised port is listening.
    pub fn for_server(
        server: &HttpServer,
        host: IpAddr,
        identity: &DeviceIdentity,
    ) -> Result<Self> {
        Ok(Self {
            udn: identity.udn()?,
            service_type: DEVICE_TYPE.to_string(),
            location: format!("http://{}/desc.html", SocketAddr::new(host, server.port())),
        })
    }

    /// `(NT, USN)` pairs announced for this entry.
    pub fn notification_types(&self) -> Vec<(String, String)> {
        vec![
            (ROOT_DEVICE.to_string(), format!("{}::{}", self.udn, ROOT_DEVICE)),
            (self.udn.clone(), self.udn.clone()),
            (
                self.service_type.clone(),
                format!("{}::{}", self.udn, self.service_type),
            ),
        ]
    }

    /// `(ST, USN)` pairs that answer a search for `target`.
    pub fn search_matches(&self, target: &str) -> Vec<(String, String)> {
        self.notification_types()
            .into_iter()
            .filter(|(nt, _)| target == "ssdp:all" || target == nt)
            .collect()
    }
}

/// A parsed `M-SEARCH` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    /// Search target.
    pub target: String,
    /// Maximum response delay requested by the client.
    pub mx: u64,
}

/// Parse an `M-SEARCH` datagram. Anything else yields `None`.
pub fn parse_search(datagram: &str) -> Option<SearchRequest> {
    let mut lines = datagram.lines();
    let request_line = lines.next()?.trim();
    if !request_line.eq_ignore_ascii_case("M-SEARCH * HTTP/1.1") {
        return None;
    }

    let mut target = None;
    let mut man = None;
    let mut mx = 1;

    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match name.trim().to_ascii_uppercase().as_str() {
            "ST" => target = Some(value.to_string()),
            "MAN" => man = Some(value.trim_matches('"').to_string()),
            "MX" => mx = value.parse().unwrap_or(1),
            _ => {}
        }
    }

    if man.as_deref() != Some("ssdp:discover") {
        return None;
    }

    Some(SearchRequest {
        target: target?,
        mx: mx.min(MAX_MX_SECS),
    })
}

/// `NOTIFY ssdp:alive` message.
pub fn alive_message(entry: &BeaconEntry, nt: &str, usn: &str, server: &str) -> String {
    format!(
        "NOTIFY * HTTP/1.1\r\n\
         HOST: {SSDP_MULTICAST_ADDR}:{SSDP_PORT}\r\n\
         CACHE-CONTROL: max-age={MAX_AGE_SECS}\r\n\
         LOCATION: {}\r\n\
         NT: {nt}\r\n\
         NTS: ssdp:alive\r\n\
         SERVER: {server}\r\n\
         USN: {usn}\r\n\
         \r\n",
        entry.location
    )
}

/// `NOTIFY ssdp:byebye` message.
pub fn byebye_message(nt: &str, usn: &str) -> String {
    format!(
        "NOTIFY * HTTP/1.1\r\n\
         HOST: {SSDP_MULTICAST_ADDR}:{SSDP_PORT}\r\n\
         NT: {nt}\r\n\
         NTS: ssdp:byebye\r\n\
         USN: {usn}\r\n\
         \r\n"
    )
}

/// Unicast answer to an `M-SEARCH`.
pub fn search_response(entry: &BeaconEntry, st: &str, usn: &str, server: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\n\
         CACHE-CONTROL: max-age={MAX_AGE_SECS}\r\n\
         DATE: {}\r\n\
         EXT:\r\n\
         LOCATION: {}\r\n\
         SERVER: {server}\r\n\
         ST: {st}\r\n\
         USN: {usn}\r\n\
         \r\n",
        chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT"),
        entry.location
    )
}

fn server_header() -> String {
    format!(
        "{}/1.0 UPnP/1.1 blind-bridge/{}",
        std::env::consts::OS,
        env!("CARGO_PKG_VERSION")
    )
}

struct BeaconInner {
    /// Socket used for both multicast and unicast traffic.
    socket: UdpSocket,
    /// Advertised entries by UDN.
    entries: RwLock<BTreeMap<String, BeaconEntry>>,
    /// Value of the `SERVER` header.
    server: String,
    /// Where multicast announcements go.
    multicast: SocketAddr,
}

/// Process-wide SSDP responder. Cheap to clone.
#[derive(Clone)]
pub struct SsdpBeacon {
    inner: Arc<BeaconInner>,
}

impl SsdpBeacon {
    /// Bind the SSDP port and join the multicast group on `interface`.
    ///
    /// If the port is taken (another SSDP stack on this host), the beacon
    /// falls back to an ephemeral port: announcements still go out but
    /// searches are not answered.
    pub async fn bind(interface: Ipv4Addr) -> Result<Self> {
        let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, SSDP_PORT)).await {
            Ok(socket) => {
                socket.join_multicast_v4(SSDP_MULTICAST_ADDR, interface)?;
                socket
            }
            Err(e) => {
                warn!(
                    "SSDP port {} unavailable ({}), announcing only; searches will not be answered",
                    SSDP_PORT, e
                );
                UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?
            }
        };

        if let Err(e) = socket.set_multicast_loop_v4(true) {
            debug!("multicast loopback unavailable: {}", e);
        }

        info!("SSDP beacon on {}", socket.local_addr()?);

        Ok(Self::from_socket(
            socket,
            SocketAddr::new(IpAddr::V4(SSDP_MULTICAST_ADDR), SSDP_PORT),
        ))
    }

    /// Beacon on an already bound socket, announcing to `multicast`.
    pub(crate) fn from_socket(socket: UdpSocket, multicast: SocketAddr) -> Self {
        Self {
            inner: Arc::new(BeaconInner {
                socket,
                entries: RwLock::new(BTreeMap::new()),
                server: server_header(),
                multicast,
            }),
        }
    }

    /// Register an entry and announce it.
    pub async fn advertise(&self, entry: BeaconEntry) -> Result<()> {
        self.inner
            .entries
            .write()
            .insert(entry.udn.clone(), entry.clone());

        info!("SSDP advertising {} at {}", entry.udn, entry.location);
        self.announce(&entry).await
    }

    /// Remove an entry and send `byebye`. Returns `false` if it was not advertised.
    pub async fn withdraw(&self, udn: &str) -> Result<bool> {
        let removed = self.inner.entries.write().remove(udn);
        let Some(entry) = removed else {
            return Ok(false);
        };

        info!("SSDP withdrawing {}", entry.udn);

        for (nt, usn) in entry.notification_types() {
            self.inner
                .socket
                .send_to(byebye_message(&nt, &usn).as_bytes(), self.inner.multicast)
                .await?;
        }

        Ok(true)
    }

    /// Whether `udn` is currently advertised.
    pub fn is_advertised(&self, udn: &str) -> bool {
        self.inner.entries.read().contains_key(udn)
    }

    /// Currently advertised entries.
    pub fn entries(&self) -> Vec<BeaconEntry> {
        self.inner.entries.read().values().cloned().collect()
    }

    /// Answer searches and re-announce periodically until the task is dropped.
    pub async fn run(self) {
        let mut buf = vec![0u8; 2048];
        let mut ticker = tokio::time::interval(NOTIFY_INTERVAL);
        ticker.tick().await;

        loop {
            tokio::select! {
                received = self.inner.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, from)) => {
                            let datagram = String::from_utf8_lossy(&buf[..len]);
                            if let Some(search) = parse_search(&datagram) {
                                self.respond(search, from);
                            }
                        }
                        Err(e) => warn!("SSDP receive failed: {}", e),
                    }
                }
                _ = ticker.tick() => {
                    for entry in self.entries() {
                        if let Err(e) = self.announce(&entry).await {
                            warn!("SSDP re-announce of {} failed: {}", entry.udn, e);
                        }
                    }
                }
            }
        }
    }

    async fn announce(&self, entry: &BeaconEntry) -> Result<()> {
        for (nt, usn) in entry.notification_types() {
            let message = alive_message(entry, &nt, &usn, &self.inner.server);
            self.inner
                .socket
                .send_to(message.as_bytes(), self.inner.multicast)
                .await?;
        }
        Ok(())
    }

    /// Schedule the unicast answers to one search.
    fn respond(&self, search: SearchRequest, to: SocketAddr) {
        let answers: Vec<String> = self
            .entries()
            .iter()
            .flat_map(|entry| {
                entry
                    .search_matches(&search.target)
                    .into_iter()
                    .map(|(st, usn)| search_response(entry, &st, &usn, &self.inner.server))
                    .collect::<Vec<_>>()
            })
            .collect();

        if answers.is_empty() {
            return;
        }

        trace!("M-SEARCH for {} from {}: {} answer(s)", search.target, to, answers.len());

        // Spread answers over part of the MX window so replies from many
        // devices do not arrive at once.
        let delay = Duration::from_millis(search.mx * 1000 / 4);
        let beacon = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            for answer in answers {
                if let Err(e) = beacon.inner.socket.send_to(answer.as_bytes(), to).await {
                    debug!("SSDP answer to {} failed: {}", to, e);
                }
            }
        });
    }
}

impl std::fmt::Debug for SsdpBeacon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SsdpBeacon")
            .field("local_addr", &self.inner.socket.local_addr().ok())
            .field("entries", &self.inner.entries.read().len())
            .finish()
    }
}
