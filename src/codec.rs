//! Self-describing wire envelope: a 5-byte header (format marker + schema
//! id) in front of an Avro-encoded body. The writer picks the schema at
//! publish time; the reader resolves whatever id the envelope carries, so
//! the two sides can evolve independently as long as the registry never
//! reuses an id for an incompatible definition.

use std::sync::Arc;

use apache_avro::types::{Record, Value};
use apache_avro::{from_avro_datum, to_avro_datum};
use chrono::{DateTime, Utc};

use crate::error::{AppError, Result};
use crate::schema::{SchemaHandle, SchemaRegistry, SchemaResolver};

/// Only supported envelope format. A non-zero marker means a format this
/// process does not understand and must never guess at.
pub const FORMAT_MARKER: u8 = 0x00;

/// Marker byte plus big-endian u32 schema id.
pub const HEADER_LEN: usize = 5;

/// A message as the producer builds it, immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalMessage {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub payload: String,
}

/// Typed decode result. The timestamp is populated from the schema's
/// `timestamp-millis` logical type; fields absent from the writer schema
/// stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedMessage {
    pub id: Option<i64>,
    pub timestamp: Option<DateTime<Utc>>,
    pub payload: Option<String>,
}

impl DecodedMessage {
    fn from_avro(value: Value) -> Self {
        let mut decoded = Self::default();
        let Value::Record(fields) = value else {
            return decoded;
        };
        for (name, field) in fields {
            match (name.as_str(), field) {
                ("id", Value::Long(v)) => decoded.id = Some(v),
                ("id", Value::Int(v)) => decoded.id = Some(i64::from(v)),
                ("timestamp", Value::TimestampMillis(ms)) | ("timestamp", Value::Long(ms)) => {
                    decoded.timestamp = DateTime::from_timestamp_millis(ms);
                }
                ("payload", Value::String(s)) => decoded.payload = Some(s),
                _ => {}
            }
        }
        decoded
    }
}

/// Split a wire envelope into its schema id and body without touching the
/// body. Rejects anything shorter than the header or carrying an unknown
/// format marker before any parsing happens.
pub fn split_envelope(data: &[u8]) -> Result<(u32, &[u8])> {
    if data.len() < HEADER_LEN {
        return Err(AppError::MalformedEnvelope(format!(
            "message too short: {} bytes",
            data.len()
        )));
    }
    if data[0] != FORMAT_MARKER {
        return Err(AppError::MalformedEnvelope(format!(
            "unsupported format marker: {:#04x}",
            data[0]
        )));
    }
    let schema_id = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
    Ok((schema_id, &data[HEADER_LEN..]))
}

/// Publish-side codec bound to one resolved schema.
pub struct WireCodec {
    schema: Arc<SchemaHandle>,
}

impl WireCodec {
    pub fn new(schema: Arc<SchemaHandle>) -> Self {
        Self { schema }
    }

    pub fn schema_id(&self) -> u32 {
        self.schema.id
    }

    pub fn encode(&self, message: &LogicalMessage) -> Result<Vec<u8>> {
        let mut record = Record::new(&self.schema.parsed)
            .ok_or_else(|| AppError::Encoding("schema is not a record".to_string()))?;
        record.put("id", Value::Long(message.id));
        record.put(
            "timestamp",
            Value::TimestampMillis(message.timestamp.timestamp_millis()),
        );
        record.put("payload", Value::String(message.payload.clone()));

        let body =
            to_avro_datum(&self.schema.parsed, record).map_err(|e| AppError::Encoding(e.to_string()))?;

        let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
        buf.push(FORMAT_MARKER);
        buf.extend_from_slice(&self.schema.id.to_be_bytes());
        buf.extend_from_slice(&body);
        Ok(buf)
    }
}

/// Consume-side codec. The schema is chosen by the id embedded in the data,
/// resolved through the registry on first sight.
pub struct MessageDecoder<R> {
    resolver: Arc<SchemaResolver<R>>,
}

impl<R: SchemaRegistry> MessageDecoder<R> {
    pub fn new(resolver: Arc<SchemaResolver<R>>) -> Self {
        Self { resolver }
    }

    pub async fn decode(&self, data: &[u8]) -> Result<(u32, DecodedMessage)> {
        let (schema_id, body) = split_envelope(data)?;
        let handle = self.resolver.get_by_id(schema_id).await?;
        let value = from_avro_datum(&handle.parsed, &mut &*body, None)
            .map_err(|e| AppError::Decoding(e.to_string()))?;
        Ok((schema_id, DecodedMessage::from_avro(value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::fake::FakeRegistry;
    use crate::schema::MESSAGE_SCHEMA;
    use apache_avro::Schema;

    fn handle(id: u32) -> Arc<SchemaHandle> {
        Arc::new(SchemaHandle {
            id,
            subject: Some("test-topic-value".to_string()),
            definition: MESSAGE_SCHEMA.to_string(),
            parsed: Schema::parse_str(MESSAGE_SCHEMA).unwrap(),
        })
    }

    fn sample_message() -> LogicalMessage {
        LogicalMessage {
            id: 42,
            timestamp: DateTime::from_timestamp_millis(1_678_901_234_567).unwrap(),
            payload: "Test message #42".to_string(),
        }
    }

    #[test]
    fn envelope_header_is_marker_plus_big_endian_id() {
        let codec = WireCodec::new(handle(0x0102_0304));
        let wire = codec.encode(&sample_message()).unwrap();
        assert!(wire.len() > HEADER_LEN);
        assert_eq!(wire[0], FORMAT_MARKER);
        assert_eq!(&wire[1..5], &[0x01, 0x02, 0x03, 0x04]);
    }

    #[tokio::test]
    async fn round_trip_preserves_message() {
        let codec = WireCodec::new(handle(7));
        let message = sample_message();
        let wire = codec.encode(&message).unwrap();

        let resolver = Arc::new(SchemaResolver::new(FakeRegistry::with_schema(
            7,
            MESSAGE_SCHEMA,
        )));
        let decoder = MessageDecoder::new(resolver);
        let (schema_id, decoded) = decoder.decode(&wire).await.unwrap();

        assert_eq!(schema_id, 7);
        assert_eq!(decoded.id, Some(message.id));
        assert_eq!(decoded.timestamp, Some(message.timestamp));
        assert_eq!(decoded.payload, Some(message.payload));
    }

    #[test]
    fn short_input_is_rejected_before_parsing() {
        for input in [&[][..], &[0x00][..], &[0x00, 0, 0, 1][..]] {
            let err = split_envelope(input).unwrap_err();
            assert!(matches!(err, AppError::MalformedEnvelope(_)), "{input:?}");
        }
    }

    #[test]
    fn nonzero_marker_is_rejected() {
        let err = split_envelope(&[0x01, 0, 0, 0, 7, 0xde, 0xad]).unwrap_err();
        assert!(matches!(err, AppError::MalformedEnvelope(_)));
    }

    #[tokio::test]
    async fn unknown_schema_id_surfaces_as_resolution_failure() {
        let codec = WireCodec::new(handle(9));
        let wire = codec.encode(&sample_message()).unwrap();

        let resolver = Arc::new(SchemaResolver::new(FakeRegistry::default()));
        let decoder = MessageDecoder::new(resolver);
        let err = decoder.decode(&wire).await.unwrap_err();
        assert!(matches!(err, AppError::SchemaNotFound(9)));
    }

    #[tokio::test]
    async fn corrupt_body_is_a_decoding_error() {
        let resolver = Arc::new(SchemaResolver::new(FakeRegistry::with_schema(
            7,
            MESSAGE_SCHEMA,
        )));
        let decoder = MessageDecoder::new(resolver);
        // Valid header, truncated body.
        let err = decoder.decode(&[0x00, 0, 0, 0, 7, 0x02]).await.unwrap_err();
        assert!(matches!(err, AppError::Decoding(_)));
    }
}
