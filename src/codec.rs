//! State Data Codec (C3): serializes the checkpoint record as pretty JSON,
//! the same `serde_json::to_writer_pretty` shape the teacher uses for its
//! status file, with a version gate on read.

use crate::error::{self, Result};
use crate::model::StateData;
use snafu::{ensure, ResultExt};

/// Serializes a checkpoint record. Round-trips byte-for-byte under the same
/// crate version.
pub fn encode(state: &StateData) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(state).context(error::EncodeStateSnafu)
}

/// Deserializes a checkpoint record, rejecting anything whose `version`
/// does not match what this build understands. A mismatch is a hard error,
/// not a silent upgrade.
pub fn decode(bytes: &[u8]) -> Result<StateData> {
    let state: StateData = serde_json::from_slice(bytes).context(error::DecodeStateSnafu)?;
    ensure!(
        state.version == StateData::CURRENT_VERSION,
        error::StateVersionMismatchSnafu {
            found: state.version,
            expected: StateData::CURRENT_VERSION,
        }
    );
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ReportedStatus, StateId, UpdateDescriptor};

    fn sample() -> StateData {
        StateData::new(
            StateId::UpdateFetch,
            Some(UpdateDescriptor {
                deployment_id: "dep-1".into(),
                artifact_name: "release-42".into(),
            }),
        )
        .with_status(ReportedStatus::Downloading)
    }

    #[test]
    fn round_trips_byte_for_byte() {
        let original = sample();
        let encoded_once = encode(&original).unwrap();
        let decoded = decode(&encoded_once).unwrap();
        let encoded_twice = encode(&decoded).unwrap();
        assert_eq!(encoded_once, encoded_twice);
        assert_eq!(decoded.name, original.name);
        assert_eq!(decoded.update, original.update);
        assert_eq!(decoded.status, original.status);
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let mut value = serde_json::to_value(sample()).unwrap();
        value["version"] = serde_json::json!(StateData::CURRENT_VERSION + 1);
        let bytes = serde_json::to_vec(&value).unwrap();
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, error::Error::StateVersionMismatch { .. }));
    }

    #[test]
    fn absent_update_round_trips_as_none() {
        let original = StateData::new(StateId::Init, None);
        let bytes = encode(&original).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert!(decoded.update.is_none());
    }
}
