//! Structured security audit trail (§10.3), separate from ordinary tracing
//! output and always emitted regardless of which protocol features are in
//! scope for a given build.
//!
//! NIST 800-53 Controls:
//! - AU-2: Audit Events (comprehensive event catalog)
//! - AU-3: Content of Audit Records (structured event data)
//! - AU-6: Audit Review, Analysis, and Reporting (SIEM integration)
//! - AU-12: Audit Generation (automatic event generation)

use std::net::SocketAddr;

use serde::Serialize;
use tracing::{error, info, warn};

/// Fields every audit event carries, regardless of type.
#[derive(Debug, Clone, Serialize)]
pub struct CommonFields {
    pub timestamp: String,
    pub hostname: String,
    pub service: &'static str,
    pub severity: &'static str,
}

impl CommonFields {
    fn new(severity: &'static str) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            service: "snow-owl-tftp",
            severity,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditEvent {
    ServerStarted {
        #[serde(flatten)]
        common: CommonFields,
        bind_addr: String,
        root_dir: String,
    },
    ServerShutdown {
        #[serde(flatten)]
        common: CommonFields,
    },
    TransferStarted {
        #[serde(flatten)]
        common: CommonFields,
        peer: String,
        filename: String,
        direction: String,
    },
    TransferCompleted {
        #[serde(flatten)]
        common: CommonFields,
        peer: String,
        bytes: u64,
        reason: String,
    },
    TransferFailed {
        #[serde(flatten)]
        common: CommonFields,
        peer: String,
        reason: String,
    },
    ReadDenied {
        #[serde(flatten)]
        common: CommonFields,
        peer: String,
        filename: String,
        reason: String,
    },
    WriteRequestDenied {
        #[serde(flatten)]
        common: CommonFields,
        peer: String,
        filename: String,
        reason: String,
    },
    PathTraversalAttempt {
        #[serde(flatten)]
        common: CommonFields,
        peer: String,
        filename: String,
    },
    ProtocolViolation {
        #[serde(flatten)]
        common: CommonFields,
        peer: String,
        detail: String,
    },
    ConfigurationLoaded {
        #[serde(flatten)]
        common: CommonFields,
        path: String,
    },
    ConfigurationError {
        #[serde(flatten)]
        common: CommonFields,
        detail: String,
    },
}

impl AuditEvent {
    fn common(&self) -> &CommonFields {
        match self {
            AuditEvent::ServerStarted { common, .. }
            | AuditEvent::ServerShutdown { common }
            | AuditEvent::TransferStarted { common, .. }
            | AuditEvent::TransferCompleted { common, .. }
            | AuditEvent::TransferFailed { common, .. }
            | AuditEvent::ReadDenied { common, .. }
            | AuditEvent::WriteRequestDenied { common, .. }
            | AuditEvent::PathTraversalAttempt { common, .. }
            | AuditEvent::ProtocolViolation { common, .. }
            | AuditEvent::ConfigurationLoaded { common, .. }
            | AuditEvent::ConfigurationError { common, .. } => common,
        }
    }

    /// Serialize to JSON and emit through `tracing` at a level derived from
    /// the event's severity, tagged so log shippers can split the audit
    /// stream out of ordinary operational logs.
    pub fn log(&self) {
        let json = match serde_json::to_string(self) {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, "failed to serialize audit event");
                return;
            }
        };
        match self.common().severity {
            "error" => error!(target: "audit", "{json}"),
            "warn" => warn!(target: "audit", "{json}"),
            _ => info!(target: "audit", "{json}"),
        }
    }
}

/// Convenience constructors used at each call site, one per event kind.
pub struct AuditLogger;

impl AuditLogger {
    pub fn server_started(bind_addr: SocketAddr, root_dir: &std::path::Path) {
        AuditEvent::ServerStarted {
            common: CommonFields::new("info"),
            bind_addr: bind_addr.to_string(),
            root_dir: root_dir.display().to_string(),
        }
        .log();
    }

    pub fn server_shutdown() {
        AuditEvent::ServerShutdown {
            common: CommonFields::new("info"),
        }
        .log();
    }

    pub fn transfer_started(peer: &SocketAddr, filename: &str, direction: &str) {
        AuditEvent::TransferStarted {
            common: CommonFields::new("info"),
            peer: peer.to_string(),
            filename: filename.to_string(),
            direction: direction.to_string(),
        }
        .log();
    }

    pub fn transfer_completed(peer: &SocketAddr, bytes: u64, reason: &str) {
        AuditEvent::TransferCompleted {
            common: CommonFields::new("info"),
            peer: peer.to_string(),
            bytes,
            reason: reason.to_string(),
        }
        .log();
    }

    pub fn transfer_failed(peer: &SocketAddr, reason: &str) {
        AuditEvent::TransferFailed {
            common: CommonFields::new("warn"),
            peer: peer.to_string(),
            reason: reason.to_string(),
        }
        .log();
    }

    pub fn read_denied(peer: &SocketAddr, filename: &str, reason: &str) {
        AuditEvent::ReadDenied {
            common: CommonFields::new("warn"),
            peer: peer.to_string(),
            filename: filename.to_string(),
            reason: reason.to_string(),
        }
        .log();
    }

    pub fn write_request_denied(peer: &SocketAddr, filename: &str, reason: &str) {
        AuditEvent::WriteRequestDenied {
            common: CommonFields::new("warn"),
            peer: peer.to_string(),
            filename: filename.to_string(),
            reason: reason.to_string(),
        }
        .log();
    }

    pub fn path_traversal_attempt(peer: &SocketAddr, filename: &str) {
        AuditEvent::PathTraversalAttempt {
            common: CommonFields::new("error"),
            peer: peer.to_string(),
            filename: filename.to_string(),
        }
        .log();
    }

    pub fn protocol_violation(peer: &SocketAddr, detail: &str) {
        AuditEvent::ProtocolViolation {
            common: CommonFields::new("warn"),
            peer: peer.to_string(),
            detail: detail.to_string(),
        }
        .log();
    }

    pub fn configuration_loaded(path: &std::path::Path) {
        AuditEvent::ConfigurationLoaded {
            common: CommonFields::new("info"),
            path: path.display().to_string(),
        }
        .log();
    }

    pub fn configuration_error(detail: &str) {
        AuditEvent::ConfigurationError {
            common: CommonFields::new("error"),
            detail: detail.to_string(),
        }
        .log();
    }
}
