//! Per-connection request info and access logging.

use std::fmt;
use std::time::{Duration, Instant};

use portcullis_networking::Address;
use tracing::info;

/// Why a connection ended without being served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFlag {
    /// No filter chain matched the socket.
    NoRouteFound,
    /// A listener filter did not finish in time.
    ListenerFilterTimeout,
}

impl fmt::Display for ResponseFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseFlag::NoRouteFound => write!(f, "NR"),
            ResponseFlag::ListenerFilterTimeout => write!(f, "LFT"),
        }
    }
}

/// What the listener learned about one downstream socket.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    start: Instant,
    local_address: Address,
    remote_address: Address,
    connection_id: Option<u64>,
    filter_chain_name: Option<String>,
    response_flag: Option<ResponseFlag>,
    details: Option<&'static str>,
}

impl StreamInfo {
    pub fn new(start: Instant, local_address: Address, remote_address: Address) -> Self {
        Self {
            start,
            local_address,
            remote_address,
            connection_id: None,
            filter_chain_name: None,
            response_flag: None,
            details: None,
        }
    }

    pub fn start(&self) -> Instant {
        self.start
    }

    pub fn duration(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn connection_id(&self) -> Option<u64> {
        self.connection_id
    }

    pub fn set_connection_id(&mut self, id: u64) {
        self.connection_id = Some(id);
    }

    pub fn filter_chain_name(&self) -> Option<&str> {
        self.filter_chain_name.as_deref()
    }

    pub fn set_filter_chain_name(&mut self, name: &str) {
        self.filter_chain_name = Some(name.to_string());
    }

    pub fn response_flag(&self) -> Option<ResponseFlag> {
        self.response_flag
    }

    pub fn set_response_flag(&mut self, flag: ResponseFlag) {
        self.response_flag = Some(flag);
    }

    pub fn details(&self) -> Option<&'static str> {
        self.details
    }

    pub fn set_details(&mut self, details: &'static str) {
        self.details = Some(details);
    }

    /// Emit one access log line.
    pub fn log(&self, listener: &str) {
        info!(
            target: "access_log",
            listener = %listener,
            downstream_local = %self.local_address,
            downstream_remote = %self.remote_address,
            connection_id = self.connection_id,
            filter_chain = self.filter_chain_name.as_deref().unwrap_or("-"),
            response_flag = %self.response_flag.map(|f| f.to_string()).unwrap_or_else(|| "-".to_string()),
            details = self.details.unwrap_or("-"),
            duration_ms = self.duration().as_millis() as u64,
            "Downstream connection finished"
        );
    }
}
