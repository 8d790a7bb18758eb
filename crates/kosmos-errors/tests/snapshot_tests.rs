//! Snapshot tests for error message formatting.
//!
//! These tests verify that error messages are formatted consistently
//! and remain stable across changes.

use kosmos_errors::{
    buffer::BufferError,
    common::KosmosError,
    config::ConfigError,
    domain::DomainError,
    fatal::FatalHardwareError,
    sequencer::{ModuleCounters, SequencerError, SequencerErrorKind, StatusReport},
    transport::TransportError,
};

mod transport_error_snapshots {
    use super::*;
    use insta::assert_snapshot;

    #[test]
    fn test_flow_control() {
        let err = TransportError::FlowControl {
            module_id: 0x02,
            code: 0x05,
        };
        assert_snapshot!(err.to_string(), @"Bulk upload to module 0x02 rejected (code 0x05)");
    }

    #[test]
    fn test_unexpected_reply() {
        let err = TransportError::UnexpectedReply {
            module_id: 0x00,
            cmd_id: 0x01,
            got_id: 0x02,
            got_cmd: 0x81,
        };
        assert_snapshot!(err.to_string(), @"Unexpected reply 0x02:0x81 to request 0x00:0x01");
    }

    #[test]
    fn test_closed() {
        assert_snapshot!(TransportError::Closed.to_string(), @"Link closed");
    }
}

mod domain_error_snapshots {
    use super::*;
    use insta::assert_snapshot;

    #[test]
    fn test_out_of_range() {
        let err = DomainError::out_of_range("mantissa", 4095u16, 1u16, 4094u16);
        assert_snapshot!(err.to_string(), @"mantissa = 4095 is out of range [1, 4094]");
    }

    #[test]
    fn test_unsupported_action() {
        let err = DomainError::unsupported_action("TIMERS", "start GLOBAL");
        assert_snapshot!(err.to_string(), @"TIMERS does not support start GLOBAL");
    }

    #[test]
    fn test_unknown_key() {
        assert_snapshot!(DomainError::unknown_key("F13").to_string(), @"Unknown key: F13");
    }
}

mod buffer_error_snapshots {
    use super::*;
    use insta::assert_snapshot;

    #[test]
    fn test_download_mismatch() {
        let err = BufferError::download_mismatch("LED_SPY", 20, 16);
        assert_snapshot!(err.to_string(), @"LED_SPY download mismatch: expected 20 entries, got 16");
    }
}

mod sequencer_error_snapshots {
    use super::*;
    use insta::assert_snapshot;

    #[test]
    fn test_timeout_with_report() {
        let report = StatusReport::new("RUNNING").with_modules(vec![ModuleCounters {
            name: "PES".to_string(),
            fifo_count: 2,
            buffer_count: 0,
            overrun: false,
            underrun: false,
        }]);
        let err = SequencerError::new(SequencerErrorKind::Timeout { timeout_ms: 500 }, report);
        assert_snapshot!(
            err.to_string().replace('\n', "|"),
            @"Sequence did not finish within 500 ms|Sequencer state: RUNNING|  PES: fifo=2 buffer=0"
        );
    }

    #[test]
    fn test_unexpected_state() {
        let kind = SequencerErrorKind::UnexpectedState {
            step: "reset".to_string(),
            expected: "RESET_DONE".to_string(),
            actual: "IDLE".to_string(),
        };
        assert_snapshot!(kind.to_string(), @"reset: expected state RESET_DONE, got IDLE");
    }
}

mod kosmos_error_snapshots {
    use super::*;
    use insta::assert_snapshot;

    #[test]
    fn test_fatal_wrapped() {
        let err: KosmosError = FatalHardwareError::GlobalErrorRaised.into();
        assert_snapshot!(err.to_string(), @"Fatal hardware error: FPGA raised the global error line");
    }

    #[test]
    fn test_config_msg_id() {
        let err: KosmosError = ConfigError::MsgIdOutOfRange {
            module: "LED_SPY#1".to_string(),
            msg_id: 0x40,
            min: 0x10,
            max: 0x3F,
        }
        .into();
        assert_snapshot!(
            err.to_string(),
            @"Configuration error: Module LED_SPY#1 uses message id 0x40 outside [0x10, 0x3f]"
        );
    }
}
