// SPDX-License-Identifier: GPL-2.0
//
// freqd: D-Bus privilege boundary.
//
// The only component with write access to scaling state. Every apply
// request is re-validated here regardless of what the caller claims to
// have checked; payloads are JSON strings with a hard size cap.

use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use zbus::blocking::connection;
use zbus::fdo;
use zbus::interface;
use zbus::message::Header;

use freqd_core::{
    EnforcementResult, EngineError, PolicyEngine, Profile, ProfileStore, TopologySnapshot,
    ValidationError,
};

pub const BUS_NAME: &str = "org.freqd.Manager";
pub const OBJECT_PATH: &str = "/org/freqd/Manager";

/// Requests larger than this are rejected without being parsed.
pub const MAX_REQUEST_BYTES: usize = 64 * 1024;

#[derive(Debug, Serialize, Deserialize)]
pub struct StateReply {
    pub topology: TopologySnapshot,
    pub profile: Option<Profile>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyReply {
    Applied { result: EnforcementResult },
    Rejected { validation_errors: Vec<ValidationError> },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveReply {
    Saved { name: String },
    Rejected { validation_errors: Vec<ValidationError> },
}

/// Parse an incoming profile payload, enforcing the size cap first.
pub fn decode_profile(payload: &str) -> fdo::Result<Profile> {
    if payload.len() > MAX_REQUEST_BYTES {
        return Err(fdo::Error::LimitsExceeded(format!(
            "request of {} bytes exceeds the {} byte limit",
            payload.len(),
            MAX_REQUEST_BYTES
        )));
    }
    serde_json::from_str(payload)
        .map_err(|e| fdo::Error::InvalidArgs(format!("malformed profile payload: {e}")))
}

fn to_json<T: Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(format!("encoding reply: {e}")))
}

pub struct Manager {
    engine: Arc<PolicyEngine>,
    store: Arc<ProfileStore>,
    allowed_uids: Vec<u32>,
    /// Separate bus connection for caller-credential lookups, so handler
    /// threads never issue calls through the connection they serve.
    query_bus: zbus::blocking::Connection,
}

impl Manager {
    pub fn new(
        engine: Arc<PolicyEngine>,
        store: Arc<ProfileStore>,
        allowed_uids: Vec<u32>,
    ) -> zbus::Result<Self> {
        Ok(Manager {
            engine,
            store,
            allowed_uids,
            query_bus: zbus::blocking::Connection::system()?,
        })
    }

    fn caller_uid(&self, hdr: &Header<'_>) -> fdo::Result<u32> {
        let sender = hdr
            .sender()
            .ok_or_else(|| fdo::Error::AccessDenied("caller has no bus name".to_string()))?;
        let proxy = zbus::blocking::Proxy::new(
            &self.query_bus,
            "org.freedesktop.DBus",
            "/org/freedesktop/DBus",
            "org.freedesktop.DBus",
        )
        .map_err(|e| fdo::Error::Failed(format!("bus query: {e}")))?;
        proxy
            .call("GetConnectionUnixUser", &(sender.as_str(),))
            .map_err(|e| fdo::Error::Failed(format!("resolving caller uid: {e}")))
    }

    /// Mutating operations require root or an explicitly allowed uid.
    fn authorize(&self, hdr: &Header<'_>) -> fdo::Result<()> {
        let uid = self.caller_uid(hdr)?;
        if uid == 0 || self.allowed_uids.contains(&uid) {
            Ok(())
        } else {
            warn!("rejected request from uid {uid}");
            Err(fdo::Error::AccessDenied(format!(
                "uid {uid} is not allowed to change scaling state"
            )))
        }
    }
}

#[interface(name = "org.freqd.Manager1")]
impl Manager {
    /// Live topology plus the last-known-good profile, as JSON.
    fn get_state(&self) -> fdo::Result<String> {
        let topology = self
            .engine
            .snapshot()
            .map_err(|e| fdo::Error::Failed(e.to_string()))?;
        to_json(&StateReply {
            topology,
            profile: self.engine.current_profile(),
        })
    }

    /// Validate and apply a candidate profile. The reply is either the
    /// enforcement result or the full set of validation errors.
    fn apply_profile(&self, #[zbus(header)] hdr: Header<'_>, payload: &str) -> fdo::Result<String> {
        self.authorize(&hdr)?;
        let profile = decode_profile(payload)?;
        info!("apply request for profile `{}`", profile.name);

        match self.engine.apply_profile(&profile) {
            Ok(result) => to_json(&ApplyReply::Applied { result }),
            Err(EngineError::Invalid(validation_errors)) => {
                to_json(&ApplyReply::Rejected { validation_errors })
            }
            Err(EngineError::Topology(e)) => Err(fdo::Error::Failed(e.to_string())),
        }
    }

    /// Names of every stored profile, as a JSON array.
    fn list_profiles(&self) -> fdo::Result<String> {
        let names = self
            .store
            .list()
            .map_err(|e| fdo::Error::Failed(e.to_string()))?;
        to_json(&names)
    }

    /// Validate a profile against live topology and persist it.
    fn save_profile(&self, #[zbus(header)] hdr: Header<'_>, payload: &str) -> fdo::Result<String> {
        self.authorize(&hdr)?;
        let profile = decode_profile(payload)?;

        let topology = self
            .engine
            .snapshot()
            .map_err(|e| fdo::Error::Failed(e.to_string()))?;
        if let Err(validation_errors) = freqd_core::validate(&profile, &topology) {
            return to_json(&SaveReply::Rejected { validation_errors });
        }

        self.store
            .save(&profile)
            .map_err(|e| fdo::Error::Failed(e.to_string()))?;
        to_json(&SaveReply::Saved { name: profile.name })
    }
}

/// Claim the bus name and serve the manager until the connection drops.
pub fn serve(manager: Manager) -> zbus::Result<zbus::blocking::Connection> {
    let conn = connection::Builder::system()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, manager)?
        .build()?;
    info!("serving {BUS_NAME} at {OBJECT_PATH}");
    Ok(conn)
}
