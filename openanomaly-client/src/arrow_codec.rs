//! Arrow IPC stream encoding for remote model engines
//!
//! Requests carry the context as a two-column batch (`timestamp`, `value`)
//! with request options in the schema metadata. Prediction responses carry a
//! `mean` column plus one `q<level>` column per quantile.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Float64Array, TimestampMillisecondArray};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use openanomaly_core::domain::result::{Forecast, QuantileSeries};
use openanomaly_core::domain::series::Sample;
use openanomaly_core::error::TaskError;

pub const CONTENT_TYPE: &str = "application/vnd.apache.arrow.stream";

/// Encode samples as a single-batch IPC stream.
pub fn encode_samples(
    samples: &[Sample],
    metadata: HashMap<String, String>,
) -> Result<Vec<u8>, TaskError> {
    let schema = Arc::new(Schema::new_with_metadata(
        vec![
            Field::new(
                "timestamp",
                DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into())),
                false,
            ),
            Field::new("value", DataType::Float64, false),
        ],
        metadata,
    ));

    let timestamps = TimestampMillisecondArray::from(
        samples
            .iter()
            .map(|s| s.timestamp.timestamp_millis())
            .collect::<Vec<_>>(),
    )
    .with_timezone("UTC");
    let values = Float64Array::from(samples.iter().map(|s| s.value).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![Arc::new(timestamps) as ArrayRef, Arc::new(values) as ArrayRef],
    )
    .map_err(serialization)?;

    let mut buf = Vec::new();
    {
        let mut writer = StreamWriter::try_new(&mut buf, &schema).map_err(serialization)?;
        writer.write(&batch).map_err(serialization)?;
        writer.finish().map_err(serialization)?;
    }
    Ok(buf)
}

/// Encode a forecast the way a model server responds. Used by test servers.
pub fn encode_forecast(forecast: &Forecast) -> Result<Vec<u8>, TaskError> {
    let mut fields = vec![Field::new("mean", DataType::Float64, false)];
    let mut columns: Vec<ArrayRef> = vec![Arc::new(Float64Array::from(forecast.mean.clone()))];
    for q in &forecast.quantiles {
        fields.push(Field::new(format!("q{}", q.level), DataType::Float64, false));
        columns.push(Arc::new(Float64Array::from(q.values.clone())));
    }
    let schema = Arc::new(Schema::new(fields));
    let batch = RecordBatch::try_new(schema.clone(), columns).map_err(serialization)?;

    let mut buf = Vec::new();
    {
        let mut writer = StreamWriter::try_new(&mut buf, &schema).map_err(serialization)?;
        writer.write(&batch).map_err(serialization)?;
        writer.finish().map_err(serialization)?;
    }
    Ok(buf)
}

/// Decode a prediction response stream.
///
/// Any structural problem (not an IPC stream, missing `mean`, nulls, wrong
/// column types, unparseable quantile names) is a serialization error.
pub fn decode_forecast(bytes: &[u8]) -> Result<Forecast, TaskError> {
    let reader = StreamReader::try_new(Cursor::new(bytes), None).map_err(serialization)?;

    let mut mean = Vec::new();
    let mut quantiles: Vec<QuantileSeries> = Vec::new();
    let mut saw_batch = false;

    for batch in reader {
        let batch = batch.map_err(serialization)?;
        saw_batch = true;
        let schema = batch.schema();

        for (index, field) in schema.fields().iter().enumerate() {
            let name = field.name().as_str();
            let values = float_column(batch.column(index), name)?;
            if name == "mean" {
                mean.extend(values);
            } else if let Some(level) = name.strip_prefix('q') {
                let level: f64 = level.parse().map_err(|_| {
                    TaskError::Serialization(format!("unrecognized quantile column '{name}'"))
                })?;
                match quantiles.iter_mut().find(|q| q.level == level) {
                    Some(series) => series.values.extend(values),
                    None => quantiles.push(QuantileSeries { level, values }),
                }
            }
        }
    }

    if !saw_batch {
        return Err(TaskError::Serialization("arrow stream contained no batches".into()));
    }
    if mean.is_empty() {
        return Err(TaskError::Serialization("arrow response has no 'mean' column".into()));
    }
    quantiles.sort_by(|a, b| a.level.total_cmp(&b.level));
    Ok(Forecast { mean, quantiles })
}

/// Decode a sample stream. Used by test servers.
pub fn decode_samples(bytes: &[u8]) -> Result<(Vec<Sample>, HashMap<String, String>), TaskError> {
    let reader = StreamReader::try_new(Cursor::new(bytes), None).map_err(serialization)?;
    let metadata = reader.schema().metadata().clone();

    let mut samples = Vec::new();
    for batch in reader {
        let batch = batch.map_err(serialization)?;
        let timestamps = batch
            .column_by_name("timestamp")
            .and_then(|c| c.as_any().downcast_ref::<TimestampMillisecondArray>())
            .ok_or_else(|| TaskError::Serialization("missing 'timestamp' column".into()))?;
        let values = batch
            .column_by_name("value")
            .ok_or_else(|| TaskError::Serialization("missing 'value' column".into()))
            .and_then(|c| float_column(c, "value"))?;

        for (i, value) in values.into_iter().enumerate() {
            let timestamp = chrono::DateTime::from_timestamp_millis(timestamps.value(i))
                .ok_or_else(|| TaskError::Serialization("timestamp out of range".into()))?;
            samples.push(Sample::new(timestamp, value));
        }
    }
    Ok((samples, metadata))
}

fn float_column(column: &ArrayRef, name: &str) -> Result<Vec<f64>, TaskError> {
    let array = column
        .as_any()
        .downcast_ref::<Float64Array>()
        .ok_or_else(|| TaskError::Serialization(format!("column '{name}' is not float64")))?;
    if array.null_count() > 0 {
        return Err(TaskError::Serialization(format!("column '{name}' contains nulls")));
    }
    Ok(array.values().to_vec())
}

fn serialization(err: impl std::fmt::Display) -> TaskError {
    TaskError::Serialization(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_forecast_decodes_mean_and_quantiles() {
        let forecast = Forecast {
            mean: vec![10.0, 10.0, 10.0],
            quantiles: vec![
                QuantileSeries { level: 0.1, values: vec![8.0, 8.0, 8.0] },
                QuantileSeries { level: 0.9, values: vec![12.0, 12.0, 12.0] },
            ],
        };
        let bytes = encode_forecast(&forecast).unwrap();
        assert_eq!(decode_forecast(&bytes).unwrap(), forecast);
    }

    #[test]
    fn test_malformed_stream_is_serialization_error() {
        // Plausible length prefix followed by bytes that are not a flatbuffer message.
        let malformed = [8u8, 0, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8];
        let err = decode_forecast(&malformed).unwrap_err();
        assert!(matches!(err, TaskError::Serialization(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_missing_mean_is_serialization_error() {
        let bytes = encode_forecast(&Forecast {
            mean: Vec::new(),
            quantiles: Vec::new(),
        })
        .unwrap();
        assert!(matches!(decode_forecast(&bytes), Err(TaskError::Serialization(_))));
    }

    #[test]
    fn test_samples_keep_metadata() {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();
        let samples = vec![Sample::new(t0, 1.5), Sample::new(t0 + chrono::Duration::minutes(1), 2.5)];
        let metadata = HashMap::from([("prediction_length".to_string(), "5".to_string())]);

        let bytes = encode_samples(&samples, metadata).unwrap();
        let (decoded, meta) = decode_samples(&bytes).unwrap();
        assert_eq!(decoded, samples);
        assert_eq!(meta.get("prediction_length").map(String::as_str), Some("5"));
    }
}
