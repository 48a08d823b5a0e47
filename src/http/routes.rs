//! Route table of the device HTTP adapter.

use chrono::{DateTime, Utc};
use hyper::{Method, StatusCode, Uri};
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::{description_xml, json, json_with_status, typed_response, HttpResult};
use crate::ble::connection::ConnectionState;
use crate::ble::uuids::from_short;
use crate::capabilities::{CapabilityStatus, CharacteristicInfo, CharacteristicRef, ServiceInfo};
use crate::config::WriteTarget;
use crate::device_manager::{AddressType, DeviceManager};
use crate::error::Error;

/// A list that is either available or replaced by an explanation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Listing<T> {
    /// The discovered items.
    Available(Vec<T>),
    /// Why the items cannot be listed.
    Unavailable(String),
}

/// Body of the status resource.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    /// Advertised local name.
    pub name: String,
    /// Hardware address.
    pub address: String,
    /// Address type.
    pub address_type: AddressType,
    /// Whether the peripheral accepts connections.
    pub connectable: bool,
    /// Current link state.
    pub state: ConnectionState,
    /// Discovered services, or why they are missing.
    pub services: Listing<ServiceInfo>,
    /// Discovered characteristics, or why they are missing.
    pub characteristics: Listing<CharacteristicInfo>,
    /// Last signal strength in dBm.
    pub rssi: Option<i16>,
    /// When `rssi` was reported.
    pub rssi_updated_at: Option<DateTime<Utc>>,
}

impl DeviceStatus {
    /// Build a status body from a device and a capability snapshot.
    pub fn new(device: &DeviceManager, capabilities: &CapabilityStatus) -> Self {
        let identity = device.identity();
        let signal = device.signal();

        let (services, characteristics) = match capabilities.ready() {
            Some(set) => (
                Listing::Available(set.services.clone()),
                Listing::Available(set.characteristics.clone()),
            ),
            None => {
                let reason = capabilities
                    .unavailable_reason()
                    .unwrap_or_else(|| "not yet available".to_string());
                (
                    Listing::Unavailable(format!("Cannot get services: {}", reason)),
                    Listing::Unavailable(format!("Cannot get characteristics: {}", reason)),
                )
            }
        };

        Self {
            name: identity.name.clone(),
            address: identity.address.clone(),
            address_type: identity.address_type,
            connectable: identity.connectable,
            state: device.state(),
            services,
            characteristics,
            rssi: signal.map(|s| s.rssi),
            rssi_updated_at: signal.map(|s| s.at),
        }
    }
}

/// Request handler bound to one device.
#[derive(Debug, Clone)]
pub struct DeviceRoutes {
    /// The device being exposed.
    device: DeviceManager,
    /// Characteristic written when a request names none.
    write_target: CharacteristicRef,
    /// Bound on how long status and description wait for discovery.
    status_wait: Duration,
}

impl DeviceRoutes {
    /// Create the handler.
    pub fn new(device: DeviceManager, write_target: WriteTarget) -> Self {
        let status_wait = device.config().status_wait;
        Self {
            device,
            write_target: write_target.0,
            status_wait,
        }
    }

    /// The device being exposed.
    pub fn device(&self) -> &DeviceManager {
        &self.device
    }

    /// Answer one request. Always produces a response.
    pub async fn route(&self, method: &Method, uri: &Uri) -> HttpResult {
        debug!("{} {} requested", method, uri);

        if method != Method::GET {
            return error_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "method_not_allowed",
                "only GET is supported",
            );
        }

        match uri.path() {
            "/" => self.status().await,
            "/read-char" => self.read(uri.query()).await,
            "/char-write-req" => self.write(uri.query()).await,
            "/desc.html" => self.description().await,
            t => error_response(StatusCode::NOT_FOUND, "not_found", &format!("not found: {t}")),
        }
    }

    async fn status(&self) -> HttpResult {
        let capabilities = self.device.capabilities_within(self.status_wait).await;
        json(DeviceStatus::new(&self.device, &capabilities))
    }

    async fn read(&self, query: Option<&str>) -> HttpResult {
        let reference = match characteristic_ref(query) {
            Ok(Some(r)) => r,
            Ok(None) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "invalid_parameter",
                    "expected uuid or handle",
                )
            }
            Err(e) => return error_json(&e),
        };

        match self.device.read_characteristic(&reference).await {
            Ok(value) => json(json!({ "value": value })),
            Err(e) => error_json(&e),
        }
    }

    async fn write(&self, query: Option<&str>) -> HttpResult {
        let raw = query_param(query, "value");
        let value = raw.as_deref().map(str::parse::<i64>);

        // Echo the integer when it parsed, the raw text otherwise.
        let echo = match (&value, &raw) {
            (Some(Ok(v)), _) => json!(v),
            (_, Some(r)) => json!(r),
            _ => serde_json::Value::Null,
        };

        let byte = match value {
            Some(Ok(v)) => match u8::try_from(v) {
                Ok(b) => b,
                Err(_) => return write_failed(echo, &Error::invalid_parameter("value", v)),
            },
            Some(Err(_)) => {
                let raw = raw.unwrap_or_default();
                return write_failed(echo, &Error::invalid_parameter("value", raw));
            }
            None => return write_failed(echo, &Error::invalid_parameter("value", "<missing>")),
        };

        let reference = match characteristic_ref(query) {
            Ok(Some(r)) => r,
            Ok(None) => self.write_target,
            Err(e) => return write_failed(echo, &e),
        };

        match self.device.write_characteristic(&reference, &[byte]).await {
            Ok(done) => {
                info!("{}: wrote {} to {}", self.device.identity(), byte, reference);
                json(json!({ "done": done, "value": echo }))
            }
            Err(e) => write_failed(echo, &e),
        }
    }

    async fn description(&self) -> HttpResult {
        let capabilities = self.device.capabilities_within(self.status_wait).await;

        if capabilities.ready().is_none() {
            let reason = capabilities
                .unavailable_reason()
                .unwrap_or_else(|| "not yet available".to_string());
            return typed_response(
                format!("description {}", reason).into_bytes(),
                StatusCode::SERVICE_UNAVAILABLE,
                "text/plain",
            );
        }

        match description_xml(self.device.identity()) {
            Ok(xml) => typed_response(xml.into_bytes(), StatusCode::OK, "text/xml"),
            Err(e) => error_json(&e),
        }
    }
}

/// HTTP status for a failed device operation.
pub(crate) fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::NotConnected | Error::SessionEnded => StatusCode::SERVICE_UNAVAILABLE,
        Error::CharacteristicNotFound { .. } => StatusCode::NOT_FOUND,
        Error::InvalidParameter { .. } | Error::InvalidAddress { .. } => StatusCode::BAD_REQUEST,
        Error::Link { .. }
        | Error::Discovery { .. }
        | Error::Read { .. }
        | Error::Write { .. }
        | Error::Bluetooth(_)
        | Error::BluetoothUnavailable => StatusCode::BAD_GATEWAY,
        Error::Io(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_json(error: &Error) -> HttpResult {
    json_with_status(
        json!({ "error": error.to_string(), "kind": error.kind() }),
        status_for(error),
    )
}

fn error_response(status: StatusCode, kind: &str, message: &str) -> HttpResult {
    json_with_status(json!({ "error": message, "kind": kind }), status)
}

fn write_failed(echo: serde_json::Value, error: &Error) -> HttpResult {
    json_with_status(
        json!({
            "done": false,
            "value": echo,
            "error": error.to_string(),
            "kind": error.kind(),
        }),
        status_for(error),
    )
}

/// First value of `name` in a query string.
fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key == name).then(|| value.to_string())
        })
        .next()
}

/// Characteristic named by `uuid=` (full or 16-bit) or `handle=`, if any.
fn characteristic_ref(query: Option<&str>) -> crate::Result<Option<CharacteristicRef>> {
    if let Some(raw) = query_param(query, "uuid") {
        return parse_uuid(&raw).map(|u| Some(CharacteristicRef::Uuid(u)));
    }

    if let Some(raw) = query_param(query, "handle") {
        return raw
            .parse::<usize>()
            .map(|i| Some(CharacteristicRef::Index(i)))
            .map_err(|_| Error::invalid_parameter("handle", raw));
    }

    Ok(None)
}

fn parse_uuid(raw: &str) -> crate::Result<Uuid> {
    if raw.len() == 4 {
        if let Ok(short) = u16::from_str_radix(raw, 16) {
            return Ok(from_short(short));
        }
    }
    Uuid::parse_str(raw).map_err(|_| Error::invalid_parameter("uuid", raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::fake::{FakeLink, MOTOR_UUID};
    use crate::ble::link::{LinkEvent, LinkLayer};
    use crate::ble::uuids::DEVICE_NAME_UUID;
    use crate::config::DeviceConfig;
    use crate::device_manager::DeviceIdentity;
    use http_body_util::BodyExt;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn routes_for(link: &Arc<FakeLink>) -> DeviceRoutes {
        let link: Arc<dyn LinkLayer> = link.clone();
        let config = DeviceConfig {
            status_wait: Duration::from_millis(200),
            ..DeviceConfig::default()
        };
        let device = DeviceManager::new(
            DeviceIdentity::new("AA:BB:CC:DD:EE:FF", AddressType::Random, "SmartBlind"),
            link,
            config,
        );
        DeviceRoutes::new(device, WriteTarget::default())
    }

    async fn get(routes: &DeviceRoutes, path: &str) -> (StatusCode, String) {
        let uri: Uri = path.parse().unwrap();
        let response = routes.route(&Method::GET, &uri).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    async fn get_json(routes: &DeviceRoutes, path: &str) -> (StatusCode, serde_json::Value) {
        let (status, body) = get(routes, path).await;
        (status, serde_json::from_str(&body).unwrap())
    }

    #[test]
    fn test_query_param() {
        assert_eq!(query_param(Some("value=80&uuid=fff4"), "uuid").as_deref(), Some("fff4"));
        assert_eq!(query_param(Some("value=80"), "value").as_deref(), Some("80"));
        assert_eq!(query_param(Some("flag"), "flag").as_deref(), Some(""));
        assert_eq!(query_param(Some("value=80"), "uuid"), None);
        assert_eq!(query_param(None, "value"), None);
    }

    #[test]
    fn test_characteristic_ref_parsing() {
        assert_eq!(
            characteristic_ref(Some("uuid=fff4")).unwrap(),
            Some(CharacteristicRef::Uuid(MOTOR_UUID))
        );
        assert_eq!(
            characteristic_ref(Some("uuid=00002a00-0000-1000-8000-00805f9b34fb")).unwrap(),
            Some(CharacteristicRef::Uuid(DEVICE_NAME_UUID))
        );
        assert_eq!(
            characteristic_ref(Some("handle=4")).unwrap(),
            Some(CharacteristicRef::Index(4))
        );
        assert_eq!(characteristic_ref(Some("value=1")).unwrap(), None);
        assert!(characteristic_ref(Some("handle=-1")).is_err());
        assert!(characteristic_ref(Some("uuid=nope")).is_err());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(status_for(&Error::NotConnected), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for(&Error::SessionEnded), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            status_for(&Error::Link { reason: "x".into() }),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&Error::CharacteristicNotFound { identifier: "#9".into() }),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_status_with_capabilities() {
        let link = Arc::new(FakeLink::new());
        let routes = routes_for(&link);

        let (status, body) = get_json(&routes, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "SmartBlind");
        assert_eq!(body["address"], "AA:BB:CC:DD:EE:FF");
        assert_eq!(body["addressType"], "random");
        assert_eq!(body["connectable"], true);
        assert_eq!(body["state"], "connected");
        assert_eq!(body["services"].as_array().unwrap().len(), 2);
        assert_eq!(body["services"][0]["type"], "primary");
        assert_eq!(body["services"][0]["name"], "Generic Access");
        assert_eq!(body["characteristics"].as_array().unwrap().len(), 5);
        assert_eq!(body["characteristics"][0]["type"], json!(["read"]));
        assert_eq!(body["rssi"], serde_json::Value::Null);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_is_bounded_while_pending() {
        let link = Arc::new(FakeLink::new());
        link.set_discover_delay(Duration::from_secs(5));
        let routes = routes_for(&link);

        let (status, body) = get_json(&routes, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["services"], "Cannot get services: not yet available");
        assert_eq!(
            body["characteristics"],
            "Cannot get characteristics: not yet available"
        );
    }

    #[tokio::test]
    async fn test_status_reports_failure_distinctly() {
        let link = Arc::new(FakeLink::new());
        link.push_connect(Err(Error::Internal("out of range".into())));
        let routes = routes_for(&link);

        let (status, body) = get_json(&routes, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "disconnected");
        let services = body["services"].as_str().unwrap();
        assert!(services.starts_with("Cannot get services: unavailable:"));
        assert!(services.contains("out of range"));
    }

    #[tokio::test]
    async fn test_status_includes_signal() {
        let link = Arc::new(FakeLink::new());
        let routes = routes_for(&link);
        routes.device().handle_link_event(LinkEvent::SignalUpdate(-58));

        let (_, body) = get_json(&routes, "/").await;
        assert_eq!(body["rssi"], -58);
        assert!(body["rssiUpdatedAt"].is_string());
    }

    #[tokio::test]
    async fn test_read_before_discovery() {
        let link = Arc::new(FakeLink::new());
        let routes = routes_for(&link);

        let (status, body) = get_json(&routes, "/read-char?handle=0").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["kind"], "not_connected");
        assert_eq!(link.calls(), (0, 0, 0, 0));
    }

    #[tokio::test]
    async fn test_read_after_discovery() {
        let link = Arc::new(FakeLink::new());
        link.set_value(DEVICE_NAME_UUID, vec![0x53, 0x42]);
        let routes = routes_for(&link);
        routes.device().capabilities().await.unwrap();

        let (status, body) = get_json(&routes, "/read-char?uuid=2a00").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "value": [0x53, 0x42] }));

        let (status, body) = get_json(&routes, "/read-char?handle=99").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "characteristic_not_found");

        let (status, _) = get_json(&routes, "/read-char").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_write_default_target() {
        let link = Arc::new(FakeLink::new());
        let routes = routes_for(&link);
        routes.device().capabilities().await.unwrap();

        let (status, body) = get_json(&routes, "/char-write-req?value=80").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "done": true, "value": 80 }));
        assert_eq!(*link.written.lock(), vec![(MOTOR_UUID, vec![80], true)]);
    }

    #[tokio::test]
    async fn test_write_rejections() {
        let link = Arc::new(FakeLink::new());
        let routes = routes_for(&link);

        let (status, body) = get_json(&routes, "/char-write-req?value=12").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["done"], false);
        assert_eq!(body["value"], 12);
        assert_eq!(body["kind"], "not_connected");

        let (status, body) = get_json(&routes, "/char-write-req?value=300").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["value"], 300);
        assert_eq!(body["kind"], "invalid_parameter");

        let (status, body) = get_json(&routes, "/char-write-req?value=up").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["value"], "up");

        assert_eq!(link.write_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_behind_queued_writes_answers_within_io_timeout() {
        let link = Arc::new(FakeLink::new());
        let routes = routes_for(&link);
        routes.device().capabilities().await.unwrap();
        link.set_io_delay(Duration::from_secs(60));

        let writes: Vec<_> = (0..5)
            .map(|_| {
                let routes = routes.clone();
                tokio::spawn(async move { get(&routes, "/char-write-req?value=80").await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(1)).await;

        let started = tokio::time::Instant::now();
        let (status, body) = get_json(&routes, "/read-char?handle=0").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["kind"], "read");
        assert!(started.elapsed() <= routes.device().config().io_timeout);

        for write in writes {
            assert_eq!(write.await.unwrap().0, StatusCode::BAD_GATEWAY);
        }
    }

    #[tokio::test]
    async fn test_write_failure_reported() {
        let link = Arc::new(FakeLink::new());
        link.push_write(Err(Error::Internal("gatt write failed".into())));
        let routes = routes_for(&link);
        routes.device().capabilities().await.unwrap();

        let (status, body) = get_json(&routes, "/char-write-req?value=1&uuid=fff4").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["done"], false);
        assert_eq!(body["kind"], "write");
    }

    #[tokio::test]
    async fn test_description() {
        let link = Arc::new(FakeLink::new());
        let routes = routes_for(&link);

        let (status, body) = get(&routes, "/desc.html").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("<friendlyName>SmartBlind</friendlyName>"));
        assert!(body.contains("<UDN>uuid:AABBCCDDEEFF</UDN>"));
    }

    #[tokio::test]
    async fn test_description_unavailable_until_resolved() {
        let link = Arc::new(FakeLink::new());
        link.push_discover(Err(Error::Internal("att".into())));
        let routes = routes_for(&link);

        let (status, body) = get(&routes, "/desc.html").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.contains("unavailable"));
    }

    #[tokio::test]
    async fn test_unknown_path_and_method() {
        let link = Arc::new(FakeLink::new());
        let routes = routes_for(&link);

        let (status, body) = get_json(&routes, "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "not_found");

        let uri: Uri = "/".parse().unwrap();
        let response = routes.route(&Method::POST, &uri).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
