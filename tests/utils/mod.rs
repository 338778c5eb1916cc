#![allow(dead_code)]

use log::kv::Key;
use log::{set_max_level, Level, Log, Metadata, Record};
use rand::distr::{Alphanumeric, SampleString};
use std::cell::RefCell;

pub fn produce_mock_path() -> (String, String) {
    let client_key = rand_client_key();
    (client_key.clone(), format!("/api/features/{client_key}"))
}

pub fn rand_client_key() -> String {
    format!("sdk-{}", Alphanumeric.sample_string(&mut rand::rng(), 16))
}

pub fn construct_bool_json_payload(key: &str, val: bool) -> String {
    format!(r#"{{"features": {{"{key}": {{"defaultValue": {val}}}}}}}"#)
}

pub fn construct_stream_event(key: &str, val: bool) -> String {
    format!(
        "event: features\ndata: {}\n\n",
        construct_bool_json_payload(key, val)
    )
}

pub struct RecordingLogger {}

impl RecordingLogger {
    thread_local!(pub static LOGS: RefCell<String> = RefCell::new(String::default()));

    pub fn take() -> String {
        Self::LOGS.with_borrow_mut(std::mem::take)
    }
}

impl Log for RecordingLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level() && metadata.target().contains("featgate")
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARNING",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        let event_id = record
            .key_values()
            .get(Key::from("event_id"))
            .and_then(|id| id.to_i64())
            .unwrap_or_default();
        Self::LOGS.with_borrow_mut(|l| {
            l.push_str(format!("{level} [{event_id}] {}\n", record.args()).as_str())
        });
    }

    fn flush(&self) {}
}

pub fn log_record_init() {
    set_max_level(log::LevelFilter::Info);
    _ = log::set_logger(&RecordingLogger {});
}
