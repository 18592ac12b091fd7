//! RPC surface metadata: capability set, per-method service error codes,
//! and error mapping.
//!
//! The JSON-RPC decode/dispatch plumbing is an external collaborator; what
//! lives here is the contract it drives: which methods exist, which
//! capability each one needs, the reserved service error code per method,
//! and how categorized core errors map onto codes. Parameter decode
//! failures map to the standard `InvalidParams` (−32602).

use aim_common::error::CoreError;
use aim_core::revocation::DeviceRevocationDeliveryError;

/// Standard JSON-RPC invalid-params code.
pub const INVALID_PARAMS: i32 = -32602;
/// Stable code for a method whose subsystem is not composed in.
pub const NOT_SUPPORTED: i32 = -32099;

/// Full revocation-broadcast failure (no contact reached).
pub const DEVICE_REVOKE_FULL_FAILURE: i32 = -32052;
/// Partial revocation-broadcast failure (some contacts missed).
pub const DEVICE_REVOKE_PARTIAL_FAILURE: i32 = -32053;

bitflags::bitflags! {
    /// Subsystems the daemon was composed with, published at startup.
    ///
    /// The RPC layer gates each method on its capability and answers a
    /// stable "not supported" error when the subsystem is absent, instead
    /// of probing the daemon with runtime type assertions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        const IDENTITY  = 1 << 0;
        const CONTACTS  = 1 << 1;
        const MESSAGING = 1 << 2;
        const SESSIONS  = 1 << 3;
        const DEVICES   = 1 << 4;
        const BACKUP    = 1 << 5;
        const FILES     = 1 << 6;
        const BLOBS     = 1 << 7;
        const NODE      = 1 << 8;
        const GROUPS    = 1 << 9;
        const ACCOUNTS  = 1 << 10;
    }
}

/// An RPC-facing error: reserved code plus the preserved message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

/// The method registry: (method, required capability, service error code).
const METHODS: &[(&str, Capabilities, i32)] = &[
    // Contacts (−32010..−32014)
    ("contact.add", Capabilities::CONTACTS, -32010),
    ("contact.add_by_id", Capabilities::CONTACTS, -32011),
    ("contact.list", Capabilities::CONTACTS, -32012),
    ("contact.remove", Capabilities::CONTACTS, -32013),
    ("contact.verify", Capabilities::CONTACTS, -32014),
    // Identity & backup (−32020..−32029)
    ("identity.get", Capabilities::IDENTITY, -32020),
    ("identity.create", Capabilities::IDENTITY, -32021),
    ("identity.login", Capabilities::IDENTITY, -32022),
    ("identity.import_seed", Capabilities::IDENTITY, -32022),
    ("identity.validate_mnemonic", Capabilities::IDENTITY, -32023),
    ("backup.export", Capabilities::BACKUP, -32024),
    ("identity.export_seed", Capabilities::IDENTITY, -32025),
    ("identity.self_contact_card", Capabilities::IDENTITY, -32026),
    ("backup.restore", Capabilities::BACKUP, -32027),
    ("data.wipe", Capabilities::BACKUP, -32028),
    ("identity.change_password", Capabilities::IDENTITY, -32029),
    // Sessions (−32030)
    ("session.init", Capabilities::SESSIONS, -32030),
    // Accounts (−32034..−32036; parked in the gap after the session band so
    // every method keeps a unique reserved code)
    ("account.list", Capabilities::ACCOUNTS, -32034),
    ("account.current", Capabilities::ACCOUNTS, -32035),
    ("account.switch", Capabilities::ACCOUNTS, -32036),
    // Messages (−32040..−32047)
    ("message.send", Capabilities::MESSAGING, -32040),
    ("message.list", Capabilities::MESSAGING, -32041),
    ("message.status", Capabilities::MESSAGING, -32042),
    ("message.edit", Capabilities::MESSAGING, -32043),
    ("message.delete", Capabilities::MESSAGING, -32044),
    ("message.clear", Capabilities::MESSAGING, -32045),
    ("message.thread.send", Capabilities::MESSAGING, -32046),
    ("message.thread.list", Capabilities::MESSAGING, -32047),
    // Devices (−32050..−32054)
    ("device.list", Capabilities::DEVICES, -32050),
    ("device.add", Capabilities::DEVICES, -32051),
    ("device.revoke", Capabilities::DEVICES, -32054),
    // Files (−32060..−32064)
    ("file.put", Capabilities::FILES, -32060),
    ("file.upload.init", Capabilities::FILES, -32061),
    ("file.upload.chunk", Capabilities::FILES, -32062),
    ("file.upload.status", Capabilities::FILES, -32063),
    ("file.upload.commit", Capabilities::FILES, -32064),
    // Blobs (−32065..−32079)
    ("blob.put", Capabilities::BLOBS, -32065),
    ("blob.get", Capabilities::BLOBS, -32066),
    // Node (−32073..−32090)
    ("node.status", Capabilities::NODE, -32080),
    ("node.peers", Capabilities::NODE, -32081),
    ("node.connect", Capabilities::NODE, -32082),
];

/// Look up a method's registry entry.
fn method_entry(method: &str) -> Option<&'static (&'static str, Capabilities, i32)> {
    METHODS.iter().find(|(name, _, _)| *name == method)
}

/// The capability a method needs, if the method is known at all.
pub fn method_capability(method: &str) -> Option<Capabilities> {
    method_entry(method).map(|(_, cap, _)| *cap)
}

/// The reserved service error code for a method. Unknown methods share the
/// not-supported code.
pub fn service_error_code(method: &str) -> i32 {
    method_entry(method).map(|(_, _, code)| *code).unwrap_or(NOT_SUPPORTED)
}

/// Gate a method on the daemon's published capability set.
pub fn check_capability(caps: Capabilities, method: &str) -> Result<(), RpcError> {
    match method_capability(method) {
        Some(required) if caps.contains(required) => Ok(()),
        _ => Err(RpcError {
            code: NOT_SUPPORTED,
            message: format!("method {method} is not supported by this daemon"),
        }),
    }
}

/// Map a categorized core error onto the method's reserved code, preserving
/// the message.
pub fn map_error(method: &str, err: &CoreError) -> RpcError {
    RpcError { code: service_error_code(method), message: err.to_string() }
}

/// Map a revocation broadcast failure: full and partial failure carry
/// distinct codes so UIs can warn accordingly.
pub fn map_revocation_delivery(err: &DeviceRevocationDeliveryError) -> RpcError {
    let code = if err.is_full_failure() {
        DEVICE_REVOKE_FULL_FAILURE
    } else {
        DEVICE_REVOKE_PARTIAL_FAILURE
    };
    RpcError { code, message: err.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aim_core::revocation::RevocationFailure;

    #[test]
    fn method_codes_sit_in_their_bands() {
        assert_eq!(service_error_code("message.send"), -32040);
        assert_eq!(service_error_code("message.thread.list"), -32047);
        assert_eq!(service_error_code("session.init"), -32030);
        assert_eq!(service_error_code("contact.add"), -32010);
        assert_eq!(service_error_code("backup.export"), -32024);
        assert_eq!(service_error_code("account.list"), -32034);
        assert_eq!(service_error_code("account.current"), -32035);
        assert_eq!(service_error_code("account.switch"), -32036);
        assert_eq!(service_error_code("no.such.method"), NOT_SUPPORTED);
    }

    #[test]
    fn reserved_codes_are_unique_per_method() {
        use std::collections::BTreeMap;
        // `identity.login` / `identity.import_seed` are one import path and
        // deliberately share a code; every other code maps to one method.
        let mut seen: BTreeMap<i32, &str> = BTreeMap::new();
        for (method, _, code) in METHODS {
            if *method == "identity.import_seed" {
                continue;
            }
            if let Some(previous) = seen.insert(*code, method) {
                panic!("code {code} claimed by both {previous} and {method}");
            }
        }
        assert!(seen.contains_key(&-32034));
    }

    #[test]
    fn capability_gate_rejects_missing_subsystems() {
        let caps = Capabilities::IDENTITY | Capabilities::MESSAGING;
        assert!(check_capability(caps, "message.send").is_ok());
        let err = check_capability(caps, "node.status").unwrap_err();
        assert_eq!(err.code, NOT_SUPPORTED);
        assert!(check_capability(caps, "unknown.method").is_err());
    }

    #[test]
    fn categorized_errors_preserve_their_message() {
        let err = CoreError::NotOutbound;
        let rpc = map_error("message.edit", &err);
        assert_eq!(rpc.code, -32043);
        assert_eq!(rpc.message, "only outbound messages can be edited");
    }

    #[test]
    fn partial_and_full_revocation_failures_have_distinct_codes() {
        let partial = DeviceRevocationDeliveryError {
            attempted: 3,
            failed: 1,
            failures: vec![RevocationFailure {
                contact_id: "aim1dave0000".into(),
                category: aim_common::ErrorCategory::Network,
                error: "unreachable".into(),
            }],
        };
        assert_eq!(map_revocation_delivery(&partial).code, DEVICE_REVOKE_PARTIAL_FAILURE);

        let full = DeviceRevocationDeliveryError { attempted: 2, failed: 2, failures: Vec::new() };
        assert_eq!(map_revocation_delivery(&full).code, DEVICE_REVOKE_FULL_FAILURE);
    }
}
