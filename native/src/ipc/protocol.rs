// Text command protocol spoken with the vendor server.
//
// Requests are bare verbs. Measurement replies are `key=value` fields joined
// by `|`, where a value holding commas is an ordered list of floats.

use super::transport::Frame;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Reply sent by the server when the device produced no scan data.
pub const MEASUREMENT_ERROR_SENTINEL: &str = "Error measuring";

const FIELD_SEPARATOR: char = '|';
const KEY_VALUE_SEPARATOR: char = '=';
const ELEMENT_SEPARATOR: char = ',';

// Field names emitted by the vendor server.
pub const FIELD_CENTROID: &str = "centroid";
pub const FIELD_PEAK: &str = "peak";
pub const FIELD_PEAK_INTENSITY: &str = "peak_intensity";
pub const FIELD_DRUM_SPEED: &str = "drum_speed";
pub const FIELD_BEAM_WIDTH: &str = "beam_width";
pub const FIELD_GAUSSIAN_FIT_X: &str = "gaussian_fit_params_x";
pub const FIELD_GAUSSIAN_FIT_Y: &str = "gaussian_fit_params_y";

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Reply is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("Invalid status reply: {text:?}")]
    InvalidStatus { text: String },
    #[error("Malformed measurement field: {field:?}")]
    MalformedField { field: String },
    #[error("Invalid number {text:?} in field '{key}'")]
    InvalidNumber { key: String, text: String },
    #[error("Reply truncated after {received} bytes (transport result {result_code})")]
    Truncated { received: usize, result_code: i32 },
}

/// Commands understood by the vendor server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Status,
    Measure,
    Stop,
}

impl Command {
    pub fn verb(self) -> &'static str {
        match self {
            Command::Status => "status",
            Command::Measure => "measure",
            Command::Stop => "stop",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

/// Drum state reported by the profiler.
///
/// These meanings are inferred from observed behaviour and are not confirmed
/// by vendor documentation. Only `Stabilized` and `Spinning` allow measuring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfilerState {
    /// 3: drum speed stabilized.
    Stabilized,
    /// 4: drum starting up.
    SpinningUp,
    /// 5: drum spinning, possibly not yet stable.
    Spinning,
    Other(i32),
}

impl ProfilerState {
    pub fn from_code(code: i32) -> Self {
        match code {
            3 => ProfilerState::Stabilized,
            4 => ProfilerState::SpinningUp,
            5 => ProfilerState::Spinning,
            other => ProfilerState::Other(other),
        }
    }

    pub fn is_ready(self) -> bool {
        matches!(self, ProfilerState::Stabilized | ProfilerState::Spinning)
    }
}

/// Reply to `status`: transport result plus the raw profiler state code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusResponse {
    pub transport_result: i32,
    pub profiler_state: i32,
}

impl StatusResponse {
    pub fn parse(frame: &Frame) -> Result<Self, ProtocolError> {
        let text = frame.text()?;
        let profiler_state = text
            .trim()
            .parse::<i32>()
            .map_err(|_| ProtocolError::InvalidStatus { text: text.clone() })?;

        Ok(Self {
            transport_result: frame.result_code,
            profiler_state,
        })
    }

    pub fn state(&self) -> ProfilerState {
        ProfilerState::from_code(self.profiler_state)
    }

    /// Ready to measure: profiler state 3 or 5, regardless of transport result.
    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    /// Readiness check used during the connect handshake, which also
    /// requires a clean transport result.
    pub fn is_ready_for_connect(&self) -> bool {
        self.transport_result == 0 && self.is_ready()
    }
}

/// A single measurement field.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MeasurementValue {
    Scalar(f64),
    Sequence(Vec<f64>),
}

impl MeasurementValue {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            MeasurementValue::Scalar(value) => Some(*value),
            MeasurementValue::Sequence(_) => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&[f64]> {
        match self {
            MeasurementValue::Scalar(_) => None,
            MeasurementValue::Sequence(values) => Some(values.as_slice()),
        }
    }

    fn parse(key: &str, text: &str) -> Result<Self, ProtocolError> {
        let parse_number = |element: &str| {
            element
                .trim()
                .parse::<f64>()
                .map_err(|_| ProtocolError::InvalidNumber {
                    key: key.to_string(),
                    text: element.to_string(),
                })
        };

        if text.contains(ELEMENT_SEPARATOR) {
            let values = text
                .split(ELEMENT_SEPARATOR)
                .map(parse_number)
                .collect::<Result<Vec<f64>, _>>()?;
            Ok(MeasurementValue::Sequence(values))
        } else {
            Ok(MeasurementValue::Scalar(parse_number(text)?))
        }
    }
}

impl fmt::Display for MeasurementValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeasurementValue::Scalar(value) => write!(f, "{}", value),
            MeasurementValue::Sequence(values) => {
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, "{}", ELEMENT_SEPARATOR)?;
                    }
                    write!(f, "{}", value)?;
                }
                Ok(())
            }
        }
    }
}

/// Gaussian fit of one axis, as reported in `gaussian_fit_params_*`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GaussianFit {
    pub center: f64,
    pub width: f64,
    pub amplitude: f64,
    pub fit_percentage: f64,
}

impl GaussianFit {
    pub fn from_values(values: &[f64]) -> Option<Self> {
        match values {
            [center, width, amplitude, fit_percentage] => Some(Self {
                center: *center,
                width: *width,
                amplitude: *amplitude,
                fit_percentage: *fit_percentage,
            }),
            _ => None,
        }
    }
}

/// Field name to value mapping produced by one `measure` command.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct MeasurementRecord {
    fields: BTreeMap<String, MeasurementValue>,
}

impl MeasurementRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a measurement payload. Any malformed field fails the whole record.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let mut record = Self::new();

        for field in text.split(FIELD_SEPARATOR) {
            let mut parts = field.split(KEY_VALUE_SEPARATOR);
            let (key, value) = match (parts.next(), parts.next(), parts.next()) {
                (Some(key), Some(value), None) => (key, value),
                _ => {
                    return Err(ProtocolError::MalformedField {
                        field: field.to_string(),
                    })
                }
            };

            record.insert(key, MeasurementValue::parse(key, value)?);
        }

        Ok(record)
    }

    /// Encode in the server's wire format.
    ///
    /// A one-element sequence encodes exactly like a scalar and reads back as one.
    pub fn to_wire(&self) -> String {
        self.fields
            .iter()
            .map(|(key, value)| format!("{}{}{}", key, KEY_VALUE_SEPARATOR, value))
            .collect::<Vec<_>>()
            .join(&FIELD_SEPARATOR.to_string())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: MeasurementValue) {
        self.fields.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&MeasurementValue> {
        self.fields.get(key)
    }

    pub fn scalar(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(MeasurementValue::as_scalar)
    }

    pub fn sequence(&self, key: &str) -> Option<&[f64]> {
        self.get(key).and_then(MeasurementValue::as_sequence)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MeasurementValue)> {
        self.fields.iter().map(|(key, value)| (key.as_str(), value))
    }

    /// Centroid position (x, y).
    pub fn centroid(&self) -> Option<&[f64]> {
        self.sequence(FIELD_CENTROID)
    }

    /// Peak position (x, y).
    pub fn peak(&self) -> Option<&[f64]> {
        self.sequence(FIELD_PEAK)
    }

    /// Peak intensity in percent of full scale (x, y).
    pub fn peak_intensity(&self) -> Option<&[f64]> {
        self.sequence(FIELD_PEAK_INTENSITY)
    }

    pub fn drum_speed(&self) -> Option<f64> {
        self.scalar(FIELD_DRUM_SPEED)
    }

    /// Clip-level beam width (x, y).
    pub fn beam_width(&self) -> Option<&[f64]> {
        self.sequence(FIELD_BEAM_WIDTH)
    }

    pub fn gaussian_fit_x(&self) -> Option<GaussianFit> {
        self.sequence(FIELD_GAUSSIAN_FIT_X)
            .and_then(GaussianFit::from_values)
    }

    pub fn gaussian_fit_y(&self) -> Option<GaussianFit> {
        self.sequence(FIELD_GAUSSIAN_FIT_Y)
            .and_then(GaussianFit::from_values)
    }
}

/// Decoded reply to `measure`.
#[derive(Debug, Clone, PartialEq)]
pub enum MeasurementReply {
    Record(MeasurementRecord),
    /// The server answered with the error sentinel.
    DeviceError,
}

impl MeasurementReply {
    /// Only a complete frame is decoded; a cut record could still parse.
    pub fn parse(frame: &Frame) -> Result<Self, ProtocolError> {
        if !frame.is_complete() {
            return Err(ProtocolError::Truncated {
                received: frame.payload.len(),
                result_code: frame.result_code,
            });
        }

        let text = frame.text()?;
        if text == MEASUREMENT_ERROR_SENTINEL {
            return Ok(MeasurementReply::DeviceError);
        }
        MeasurementRecord::parse(&text).map(MeasurementReply::Record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(text: &str) -> Frame {
        Frame {
            result_code: 0,
            payload: text.as_bytes().to_vec(),
        }
    }

    #[test]
    fn parses_mixed_fields() {
        let record = MeasurementRecord::parse("Centroid=1.0,2.0|Peak=3.5|Width=0.2").unwrap();
        assert_eq!(record.len(), 3);
        assert_eq!(record.sequence("Centroid"), Some(&[1.0, 2.0][..]));
        assert_eq!(record.scalar("Peak"), Some(3.5));
        assert_eq!(record.scalar("Width"), Some(0.2));
    }

    #[test]
    fn parses_vendor_reply() {
        let reply = "centroid=12.5,-3.25|peak=12,-3|peak_intensity=87.5,90.125|drum_speed=10.02\
                     |beam_width=1500.5,1490|gaussian_fit_params_x=12.4,1480,0.98,99.1\
                     |gaussian_fit_params_y=-3.2,1470.5,0.97,98.7\r\n";
        let record = match MeasurementReply::parse(&frame(reply)).unwrap() {
            MeasurementReply::Record(record) => record,
            MeasurementReply::DeviceError => panic!("unexpected sentinel"),
        };

        assert_eq!(record.centroid(), Some(&[12.5, -3.25][..]));
        assert_eq!(record.drum_speed(), Some(10.02));
        assert_eq!(record.beam_width(), Some(&[1500.5, 1490.0][..]));

        let fit = record.gaussian_fit_x().unwrap();
        assert_eq!(fit.center, 12.4);
        assert_eq!(fit.width, 1480.0);
        assert_eq!(fit.amplitude, 0.98);
        assert_eq!(fit.fit_percentage, 99.1);
        assert!(record.gaussian_fit_y().is_some());
    }

    #[test]
    fn sentinel_is_device_error() {
        let reply = MeasurementReply::parse(&frame("Error measuring\r\n")).unwrap();
        assert_eq!(reply, MeasurementReply::DeviceError);
    }

    #[test]
    fn truncated_reply_is_rejected() {
        // Cut inside a number: the text alone would parse as 1234.5.
        let cut = Frame {
            result_code: crate::ipc::transport::RESULT_MORE_DATA,
            payload: b"drum_speed=10.02|beam_width=1234.5".to_vec(),
        };
        assert!(MeasurementRecord::parse(&cut.text().unwrap()).is_ok());

        match MeasurementReply::parse(&cut) {
            Err(ProtocolError::Truncated {
                received,
                result_code,
            }) => {
                assert_eq!(received, cut.payload.len());
                assert_eq!(result_code, 234);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn bad_number_fails_whole_record() {
        let err = MeasurementRecord::parse("peak=1.0|drum_speed=fast").unwrap_err();
        match err {
            ProtocolError::InvalidNumber { key, text } => {
                assert_eq!(key, "drum_speed");
                assert_eq!(text, "fast");
            }
            other => panic!("unexpected error: {other}"),
        }

        assert!(matches!(
            MeasurementRecord::parse("centroid=1.0,,2.0"),
            Err(ProtocolError::InvalidNumber { .. })
        ));
    }

    #[test]
    fn field_without_single_separator_is_malformed() {
        assert!(matches!(
            MeasurementRecord::parse("peak"),
            Err(ProtocolError::MalformedField { .. })
        ));
        assert!(matches!(
            MeasurementRecord::parse("peak=1=2"),
            Err(ProtocolError::MalformedField { .. })
        ));
        assert!(matches!(
            MeasurementRecord::parse(""),
            Err(ProtocolError::MalformedField { .. })
        ));
    }

    #[test]
    fn wire_format_round_trips() {
        let mut record = MeasurementRecord::new();
        record.insert("centroid", MeasurementValue::Sequence(vec![0.1, -2.75]));
        record.insert("drum_speed", MeasurementValue::Scalar(9.999));
        record.insert(
            "gaussian_fit_params_x",
            MeasurementValue::Sequence(vec![1.0, 1234.5678, 0.5, 97.25]),
        );

        let wire = record.to_wire();
        assert_eq!(
            wire,
            "centroid=0.1,-2.75|drum_speed=9.999|gaussian_fit_params_x=1,1234.5678,0.5,97.25"
        );
        assert_eq!(MeasurementRecord::parse(&wire).unwrap(), record);
    }

    #[test]
    fn status_reply_parsing() {
        let status = StatusResponse::parse(&frame("3\r\n")).unwrap();
        assert_eq!(status.profiler_state, 3);
        assert!(status.is_ready_for_connect());

        let spinning_up = StatusResponse::parse(&frame("4\r\n")).unwrap();
        assert_eq!(spinning_up.state(), ProfilerState::SpinningUp);
        assert!(!spinning_up.is_ready());

        assert!(matches!(
            StatusResponse::parse(&frame("Error\r\n")),
            Err(ProtocolError::InvalidStatus { .. })
        ));
    }

    #[test]
    fn only_states_three_and_five_are_ready() {
        for code in -1..10 {
            let expected = code == 3 || code == 5;
            assert_eq!(ProfilerState::from_code(code).is_ready(), expected, "state {code}");
        }
    }

    #[test]
    fn connect_readiness_requires_clean_transport_result() {
        let truncated = StatusResponse {
            transport_result: 234,
            profiler_state: 3,
        };
        assert!(truncated.is_ready());
        assert!(!truncated.is_ready_for_connect());
    }

    #[test]
    fn record_serializes_to_json() {
        let record = MeasurementRecord::parse("peak=1.5,2|drum_speed=10").unwrap();
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, r#"{"drum_speed":10.0,"peak":[1.5,2.0]}"#);
    }
}
