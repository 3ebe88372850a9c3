use serde_json::Value;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::db::Store;
use crate::error::{ParseError, StorageError, ValidationError};

/// A sensor reading on its way into the store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub temperature: f64,
    pub humidity: Option<f64>,
}

impl Reading {
    /// Reads `{temperature, humidity?}` from an HTTP request body. An empty body counts as `{}`.
    pub fn from_json_body(body: &[u8]) -> Result<Reading, ValidationError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(ValidationError::MissingTemperature);
        }

        let fields = match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(fields)) => fields,
            _ => return Err(ValidationError::MalformedBody),
        };

        let temperature = fields
            .get("temperature")
            .ok_or(ValidationError::MissingTemperature)
            .and_then(|value| as_number(value).ok_or(ValidationError::TemperatureNotNumeric))?;

        let humidity = match fields.get("humidity") {
            None | Some(Value::Null) => None,
            Some(value) => Some(as_number(value).ok_or(ValidationError::HumidityNotNumeric)?),
        };

        Ok(Reading {
            temperature,
            humidity,
        })
    }

    /// Reads a bare temperature such as `25.5` from an MQTT payload. Humidity is not carried.
    pub fn from_mqtt_payload(payload: &[u8]) -> Result<Reading, ParseError> {
        let text = std::str::from_utf8(payload).map_err(|_| ParseError::NotUtf8)?;
        let temperature = parse_finite(text).ok_or_else(|| ParseError::NotNumeric(text.to_owned()))?;

        Ok(Reading {
            temperature,
            humidity: None,
        })
    }
}

// JSON numbers, or strings holding one.
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => parse_finite(text),
        _ => None,
    }
}

fn parse_finite(text: &str) -> Option<f64> {
    text.trim()
        .parse::<f64>()
        .ok()
        .filter(|number| number.is_finite())
}

/// Single entry point for readings from every transport.
#[derive(Clone)]
pub struct Gateway {
    store: Store,
    discarded: Arc<AtomicU64>,
}

impl Gateway {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            discarded: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Writes a validated reading. The only path into the store.
    pub async fn submit(&self, reading: Reading) -> Result<(), StorageError> {
        self.store
            .insert(reading.temperature, reading.humidity)
            .await?;

        log::info!(
            "Measurement saved: T={}°C, H={}%",
            reading.temperature,
            reading.humidity.unwrap_or(0.0)
        );
        Ok(())
    }

    /// Handles a publish on the sensor topic. Nothing is reported back to the publisher.
    pub async fn accept_mqtt(&self, payload: &[u8]) {
        let reading = match Reading::from_mqtt_payload(payload) {
            Ok(reading) => reading,
            Err(e) => {
                self.discarded.fetch_add(1, Ordering::Relaxed);
                log::debug!("[MQTT] Discarding payload: {e}");
                return;
            }
        };

        if let Err(e) = self.submit(reading).await {
            log::error!("[MQTT] Failed to save measurement: {e}");
        }
    }

    /// MQTT payloads dropped because they were not a number.
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}
