//! Defaults shared by the relay server and the terminal client.

/// Interface the server binds to unless told otherwise
pub const DEFAULT_HOST: &str = "127.0.0.1";
/// Port the server listens on and the client dials
pub const DEFAULT_PORT: u16 = 3000;
/// Directory of browser client files served at `/`
pub const DEFAULT_ASSET_DIR: &str = "app";
/// Path at which WebSocket upgrades are accepted
pub const WS_PATH: &str = "/ws";
/// Path serving hub statistics as JSON
pub const STATS_PATH: &str = "/stats";
/// Path telling the browser client where to open its socket
pub const CLIENT_CONFIG_PATH: &str = "/config.json";

/// Slots in each connection's outbound queue before the hub evicts it
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;
/// Slots in each of the hub's event conduits
pub const EVENT_QUEUE_CAPACITY: usize = 64;

/// Builds the WebSocket URL a client dials for a given server.
///
/// A missing leading slash on `path` is tolerated.
pub fn ws_url(host: &str, port: u16, path: &str) -> String {
    if path.starts_with('/') {
        format!("ws://{}:{}{}", host, port, path)
    } else {
        format!("ws://{}:{}/{}", host, port, path)
    }
}
