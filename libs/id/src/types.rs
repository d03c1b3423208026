//! Typed ID definitions.

use crate::define_id;

define_id!(
    /// Provider-assigned handle for a provisioned machine.
    MachineId,
    "vm"
);

define_id!(
    /// Identifier of a single orchestration (`up`) invocation.
    RunId,
    "run"
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdError;
    use proptest::prelude::*;

    #[test]
    fn test_machine_id_prefix() {
        let id = MachineId::new();
        assert!(id.to_string().starts_with("vm_"));
    }

    #[test]
    fn test_machine_id_roundtrip() {
        let id = MachineId::new();
        let parsed: MachineId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_wrong_prefix_rejected() {
        let run = RunId::new().to_string();
        let err = run.parse::<MachineId>().unwrap_err();
        assert!(err.is_prefix_error());
    }

    #[test]
    fn test_missing_separator_rejected() {
        let err = "vm01HV4Z2WQXKJNM8GPQY6VBKC3D".parse::<MachineId>().unwrap_err();
        assert!(matches!(err, IdError::MissingSeparator(_)));
    }

    #[test]
    fn test_empty_rejected() {
        assert_eq!("".parse::<RunId>().unwrap_err(), IdError::Empty);
    }

    #[test]
    fn test_invalid_ulid_rejected() {
        let err = "vm_not-a-ulid".parse::<MachineId>().unwrap_err();
        assert!(matches!(err, IdError::InvalidUlid(_)));
    }

    #[test]
    fn test_short_is_suffix() {
        let id = MachineId::new();
        let short = id.short();
        assert_eq!(short.len(), crate::SHORT_ID_LEN);
        assert!(id.to_string().to_ascii_lowercase().ends_with(&short));
    }

    #[test]
    fn test_serde_as_string() {
        let id = MachineId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
        let back: MachineId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    proptest! {
        #[test]
        fn prop_parse_never_panics(s in "\\PC*") {
            let _ = s.parse::<MachineId>();
        }
    }
}
