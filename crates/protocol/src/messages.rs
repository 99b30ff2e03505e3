use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The base fields present on every framed message: the dispatch tag and an
/// optional latency-tracking envelope. Callers that only need the tag (to
/// look up a dispatch callback) decode straight into this type instead of
/// committing to a [`FramedMessage`] variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageBase {
    pub payload_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_tracker: Option<LatencyTracker>,
}

/// Every concrete message that can cross a duplex channel or data channel,
/// as a single tagged union keyed by `payload_type`. `join`/`answer`/`sdp`/
/// `ice`/`log`/`metrics` travel the room duplex channel; `input` additionally
/// travels the participant's unreliable data channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "payload_type", rename_all = "snake_case")]
pub enum FramedMessage {
    Join {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        latency_tracker: Option<LatencyTracker>,
        joiner_type: JoinerType,
    },
    Answer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        latency_tracker: Option<LatencyTracker>,
        answer_type: AnswerType,
    },
    Sdp {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        latency_tracker: Option<LatencyTracker>,
        sdp: SessionDescription,
    },
    Ice {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        latency_tracker: Option<LatencyTracker>,
        candidate: IceCandidate,
    },
    Log {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        latency_tracker: Option<LatencyTracker>,
        level: String,
        message: String,
        time: String,
    },
    Metrics {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        latency_tracker: Option<LatencyTracker>,
        usage_cpu: f64,
        usage_memory: f64,
        uptime: u64,
        pipeline_latency: f64,
    },
    Input {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        latency_tracker: Option<LatencyTracker>,
        data: String,
    },
}

impl FramedMessage {
    pub fn payload_type(&self) -> &'static str {
        match self {
            FramedMessage::Join { .. } => "join",
            FramedMessage::Answer { .. } => "answer",
            FramedMessage::Sdp { .. } => "sdp",
            FramedMessage::Ice { .. } => "ice",
            FramedMessage::Log { .. } => "log",
            FramedMessage::Metrics { .. } => "metrics",
            FramedMessage::Input { .. } => "input",
        }
    }
}

/// Ingest (`node`) vs. subscriber (`client`) discriminator on a `join` frame.
/// Wire representation is the numeric tag from the upstream protocol (0/1),
/// not a string, so (de)serialization is implemented by hand against `u8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinerType {
    Node,
    Client,
}

impl Serialize for JoinerType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(match self {
            JoinerType::Node => 0,
            JoinerType::Client => 1,
        })
    }
}

impl<'de> Deserialize<'de> for JoinerType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            0 => Ok(JoinerType::Node),
            1 => Ok(JoinerType::Client),
            other => Err(serde::de::Error::custom(format!(
                "unknown joiner_type: {other}"
            ))),
        }
    }
}

/// Room-state reply to a joiner, carried on an `answer` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerType {
    Offline,
    InUse,
    Ok,
}

impl Serialize for AnswerType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(match self {
            AnswerType::Offline => 0,
            AnswerType::InUse => 1,
            AnswerType::Ok => 2,
        })
    }
}

impl<'de> Deserialize<'de> for AnswerType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            0 => Ok(AnswerType::Offline),
            1 => Ok(AnswerType::InUse),
            2 => Ok(AnswerType::Ok),
            other => Err(serde::de::Error::custom(format!(
                "unknown answer_type: {other}"
            ))),
        }
    }
}

/// SDP offer/answer body, mirroring a WebRTC session description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub sdp: String,
}

/// An ICE candidate as exchanged over the duplex channel. `sdp_mid` and
/// `sdp_mline_index` are optional because trickled candidates do not always
/// carry them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// A single named timestamp within a [`LatencyTracker`], recorded at
/// nanosecond precision in RFC3339 form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampEntry {
    pub stage: String,
    pub time: String,
}

/// Per-message diagnostic envelope carried on `latency_tracker`. Never gates
/// control flow; it exists purely so an operator can reconstruct end-to-end
/// timing for a single message as it crosses ingest, relay, and participant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencyTracker {
    pub sequence_id: String,
    #[serde(default)]
    pub timestamps: Vec<TimestampEntry>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl LatencyTracker {
    pub fn new(sequence_id: impl Into<String>) -> Self {
        Self {
            sequence_id: sequence_id.into(),
            timestamps: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Append a timestamp for `stage`, using the current UTC time.
    pub fn add_timestamp(&mut self, stage: impl Into<String>) {
        self.timestamps.push(TimestampEntry {
            stage: stage.into(),
            time: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
        });
    }

    /// Span between the earliest and latest recorded timestamp, in
    /// milliseconds. `Some(0)` if fewer than two timestamps are present;
    /// `None` if a timestamp fails to parse.
    pub fn total_latency(&self) -> Option<i64> {
        if self.timestamps.len() < 2 {
            return Some(0);
        }
        let mut earliest: Option<chrono::DateTime<chrono::Utc>> = None;
        let mut latest: Option<chrono::DateTime<chrono::Utc>> = None;
        for ts in &self.timestamps {
            let parsed = parse_rfc3339(&ts.time)?;
            earliest = Some(match earliest {
                Some(e) if e <= parsed => e,
                _ => parsed,
            });
            latest = Some(match latest {
                Some(l) if l >= parsed => l,
                _ => parsed,
            });
        }
        Some((latest? - earliest?).num_milliseconds())
    }

    /// Duration between two named stages, in milliseconds. `None` if either
    /// stage was never recorded.
    pub fn stage_latency(&self, start_stage: &str, end_stage: &str) -> Option<i64> {
        let start = self
            .timestamps
            .iter()
            .find(|t| t.stage == start_stage)
            .and_then(|t| parse_rfc3339(&t.time))?;
        let end = self
            .timestamps
            .iter()
            .find(|t| t.stage == end_stage)
            .and_then(|t| parse_rfc3339(&t.time))?;
        Some((end - start).num_milliseconds())
    }

    /// Adjacent stage transitions whose gap exceeds `threshold_ms`,
    /// formatted as `"from -> to"`.
    pub fn pain_points(&self, threshold_ms: i64) -> Vec<String> {
        let mut points = Vec::new();
        let mut prev: Option<(&str, chrono::DateTime<chrono::Utc>)> = None;
        for ts in &self.timestamps {
            let Some(current) = parse_rfc3339(&ts.time) else {
                continue;
            };
            if let Some((prev_stage, prev_time)) = prev {
                if (current - prev_time).num_milliseconds() > threshold_ms {
                    points.push(format!("{prev_stage} -> {}", ts.stage));
                }
            }
            prev = Some((&ts.stage, current));
        }
        points
    }
}

fn parse_rfc3339(s: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&chrono::Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_wire_format_uses_numeric_tag() {
        let msg = FramedMessage::Join {
            latency_tracker: None,
            joiner_type: JoinerType::Client,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""payload_type":"join""#));
        assert!(json.contains(r#""joiner_type":1"#));
    }

    #[test]
    fn answer_wire_format_uses_numeric_tag() {
        let msg = FramedMessage::Answer {
            latency_tracker: None,
            answer_type: AnswerType::InUse,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""answer_type":1"#));
        let parsed: FramedMessage = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            parsed,
            FramedMessage::Answer {
                answer_type: AnswerType::InUse,
                ..
            }
        ));
    }

    #[test]
    fn sdp_roundtrip() {
        let msg = FramedMessage::Sdp {
            latency_tracker: None,
            sdp: SessionDescription {
                sdp_type: "offer".to_string(),
                sdp: "v=0\r\n...".to_string(),
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""payload_type":"sdp""#));
        let parsed: FramedMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            FramedMessage::Sdp { sdp, .. } => assert_eq!(sdp.sdp_type, "offer"),
            other => panic!("expected Sdp, got {other:?}"),
        }
    }

    #[test]
    fn ice_candidate_optional_fields_omitted_when_absent() {
        let msg = FramedMessage::Ice {
            latency_tracker: None,
            candidate: IceCandidate {
                candidate: "candidate:1 1 UDP 2130706431 10.0.0.1 1234 typ host".to_string(),
                sdp_mid: None,
                sdp_mline_index: None,
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("sdp_mid"));
        assert!(!json.contains("sdp_mline_index"));
    }

    #[test]
    fn ice_candidate_from_client_format() {
        let client_json = r#"{
            "payload_type": "ice",
            "candidate": {
                "candidate": "candidate:1 1 UDP 2130706431 192.168.1.1 50000 typ host",
                "sdp_mid": "0",
                "sdp_mline_index": 0
            }
        }"#;
        let msg: FramedMessage = serde_json::from_str(client_json).unwrap();
        match msg {
            FramedMessage::Ice { candidate, .. } => {
                assert!(candidate.candidate.starts_with("candidate:1"));
                assert_eq!(candidate.sdp_mid, Some("0".to_string()));
            }
            other => panic!("expected Ice, got {other:?}"),
        }
    }

    #[test]
    fn unknown_joiner_type_is_rejected() {
        let json = r#"{"payload_type":"join","joiner_type":9}"#;
        let result: Result<FramedMessage, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn payload_type_helper_matches_wire_tag() {
        let msg = FramedMessage::Metrics {
            latency_tracker: None,
            usage_cpu: 0.5,
            usage_memory: 0.25,
            uptime: 10,
            pipeline_latency: 1.5,
        };
        assert_eq!(msg.payload_type(), "metrics");
    }

    #[test]
    fn input_frame_roundtrip() {
        let msg = FramedMessage::Input {
            latency_tracker: None,
            data: "{\"t\":\"k\",\"c\":30,\"d\":true}".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""payload_type":"input""#));
        let parsed: FramedMessage = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, FramedMessage::Input { .. }));
    }

    #[test]
    fn latency_tracker_add_timestamp_and_total_latency() {
        let mut tracker = LatencyTracker::new("abc-123");
        tracker.timestamps.push(TimestampEntry {
            stage: "ingest".to_string(),
            time: "2024-01-01T00:00:00.000000000Z".to_string(),
        });
        tracker.timestamps.push(TimestampEntry {
            stage: "relay".to_string(),
            time: "2024-01-01T00:00:00.050000000Z".to_string(),
        });
        assert_eq!(tracker.total_latency(), Some(50));
    }

    #[test]
    fn latency_tracker_stage_latency_missing_stage_is_none() {
        let mut tracker = LatencyTracker::new("abc-123");
        tracker.add_timestamp("ingest");
        assert_eq!(tracker.stage_latency("ingest", "nonexistent"), None);
    }

    #[test]
    fn latency_tracker_pain_points_flags_large_gaps() {
        let mut tracker = LatencyTracker::new("abc-123");
        tracker.timestamps.push(TimestampEntry {
            stage: "ingest".to_string(),
            time: "2024-01-01T00:00:00.000000000Z".to_string(),
        });
        tracker.timestamps.push(TimestampEntry {
            stage: "relay".to_string(),
            time: "2024-01-01T00:00:01.000000000Z".to_string(),
        });
        let points = tracker.pain_points(500);
        assert_eq!(points, vec!["ingest -> relay".to_string()]);
    }

    #[test]
    fn message_base_reads_tag_without_committing_to_a_variant() {
        let msg = FramedMessage::Log {
            latency_tracker: None,
            level: "warn".to_string(),
            message: "dropped a frame".to_string(),
            time: "2024-01-01T00:00:00Z".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let base: MessageBase = serde_json::from_str(&json).unwrap();
        assert_eq!(base.payload_type, "log");
    }
}
