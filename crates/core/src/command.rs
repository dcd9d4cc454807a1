//! The 5-byte `rtl_tcp` control command frame and the policy that gates it.
//!
//! Wire shape (§3, §6): one opcode byte followed by a big-endian `u32`
//! parameter. `rtl_mus.py`'s `Client.command_allowed` is the reference for
//! every opcode's disposition.

use std::time::Duration;

use crate::config::Config;

/// Byte length of a command frame on the wire.
pub const FRAME_LEN: usize = 5;

/// A parsed 5-byte command frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFrame {
    pub opcode: u8,
    pub param: u32,
}

impl CommandFrame {
    /// Parses a frame from exactly [`FRAME_LEN`] bytes.
    #[must_use]
    pub fn parse(bytes: [u8; FRAME_LEN]) -> Self {
        let mut param_bytes = [0u8; 4];
        param_bytes.copy_from_slice(&bytes[1..5]);
        Self {
            opcode: bytes[0],
            param: u32::from_be_bytes(param_bytes),
        }
    }

    /// Re-encodes the frame into its 5-byte wire form.
    #[must_use]
    pub fn to_bytes(self) -> [u8; FRAME_LEN] {
        let mut out = [0u8; FRAME_LEN];
        out[0] = self.opcode;
        out[1..5].copy_from_slice(&self.param.to_be_bytes());
        out
    }
}

/// Result of evaluating the command policy (§4.2) against one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandDecision {
    /// Frame is dropped; never reaches the upstream.
    Deny,
    /// Frame is forwarded to the upstream command queue unchanged.
    Allow,
    /// Frame is forwarded, and the process-global `sample_rate` must be set
    /// to the carried parameter (opcode 2).
    AllowSampleRate(u32),
}

const OPCODE_SET_FREQUENCY: u8 = 1;
const OPCODE_SET_SAMPLE_RATE: u8 = 2;
const GAIN_FAMILY: [u8; 5] = [3, 4, 6, 8, 13];

/// Evaluates the command policy for one frame from one session.
///
/// `ident` is the session's admission-order identifier and `since_admission`
/// is how long ago that session was admitted; both feed the
/// `client_cant_set_until` / `first_client_can_set` gate in step 1 of §4.2.
#[must_use]
pub fn evaluate(
    config: &Config,
    ident: u64,
    since_admission: Duration,
    frame: CommandFrame,
) -> CommandDecision {
    let locked_out = since_admission.as_secs() < config.client_cant_set_until
        && !(config.first_client_can_set && ident == 0);
    if locked_out {
        return CommandDecision::Deny;
    }

    match frame.opcode {
        OPCODE_SET_FREQUENCY => {
            let in_range = config
                .freq_allowed_ranges
                .iter()
                .any(|&(lo, hi)| (lo..=hi).contains(&frame.param));
            if in_range {
                CommandDecision::Allow
            } else {
                CommandDecision::Deny
            }
        }
        OPCODE_SET_SAMPLE_RATE => {
            if config.allow_sample_rate_set {
                CommandDecision::AllowSampleRate(frame.param)
            } else {
                CommandDecision::Deny
            }
        }
        op if GAIN_FAMILY.contains(&op) => {
            if config.allow_gain_set {
                CommandDecision::Allow
            } else {
                CommandDecision::Deny
            }
        }
        _ => CommandDecision::Deny,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::base_config;

    #[test]
    fn round_trips_through_wire_bytes() {
        let frame = CommandFrame {
            opcode: 1,
            param: 100_000_000,
        };
        let bytes = frame.to_bytes();
        assert_eq!(bytes, [0x01, 0x05, 0xF5, 0xE1, 0x00]);
        assert_eq!(CommandFrame::parse(bytes), frame);
    }

    #[test]
    fn frequency_inside_range_is_allowed_inclusive_on_both_ends() {
        let mut config = base_config();
        config.freq_allowed_ranges = vec![(100_000, 200_000)];
        let frame = CommandFrame {
            opcode: 1,
            param: 100_000,
        };
        assert_eq!(
            evaluate(&config, 5, Duration::from_secs(100), frame),
            CommandDecision::Allow
        );
        let frame = CommandFrame {
            opcode: 1,
            param: 200_000,
        };
        assert_eq!(
            evaluate(&config, 5, Duration::from_secs(100), frame),
            CommandDecision::Allow
        );
    }

    #[test]
    fn frequency_outside_range_is_denied() {
        let mut config = base_config();
        config.freq_allowed_ranges = vec![(100_000, 200_000)];
        let frame = CommandFrame {
            opcode: 1,
            param: 200_001,
        };
        assert_eq!(
            evaluate(&config, 5, Duration::from_secs(100), frame),
            CommandDecision::Deny
        );
    }

    #[test]
    fn sample_rate_opcode_reports_new_rate_when_allowed() {
        let mut config = base_config();
        config.allow_sample_rate_set = true;
        let frame = CommandFrame {
            opcode: 2,
            param: 2_048_000,
        };
        assert_eq!(
            evaluate(&config, 5, Duration::from_secs(100), frame),
            CommandDecision::AllowSampleRate(2_048_000)
        );
    }

    #[test]
    fn unknown_and_explicitly_refused_opcodes_are_always_denied() {
        let config = base_config();
        for opcode in [5u8, 7, 9, 10, 11, 12, 200] {
            let frame = CommandFrame { opcode, param: 0 };
            assert_eq!(
                evaluate(&config, 5, Duration::from_secs(100), frame),
                CommandDecision::Deny,
                "opcode {opcode} should be denied"
            );
        }
    }

    #[test]
    fn gain_family_follows_allow_gain_set() {
        let mut config = base_config();
        for opcode in [3u8, 4, 6, 8, 13] {
            let frame = CommandFrame { opcode, param: 1 };
            config.allow_gain_set = false;
            assert_eq!(
                evaluate(&config, 5, Duration::from_secs(100), frame),
                CommandDecision::Deny
            );
            config.allow_gain_set = true;
            assert_eq!(
                evaluate(&config, 5, Duration::from_secs(100), frame),
                CommandDecision::Allow
            );
        }
    }

    #[test]
    fn lockout_window_blocks_everyone_but_the_first_client() {
        let mut config = base_config();
        config.client_cant_set_until = 5;
        config.first_client_can_set = true;
        config.allow_gain_set = true;
        let frame = CommandFrame { opcode: 3, param: 1 };

        assert_eq!(
            evaluate(&config, 0, Duration::from_secs(1), frame),
            CommandDecision::Allow,
            "ident 0 is exempt from the lockout by first_client_can_set"
        );
        assert_eq!(
            evaluate(&config, 1, Duration::from_secs(1), frame),
            CommandDecision::Deny,
            "ident 1 is still inside the lockout window"
        );
        assert_eq!(
            evaluate(&config, 1, Duration::from_secs(5), frame),
            CommandDecision::Allow,
            "lockout window has elapsed"
        );
    }
}
