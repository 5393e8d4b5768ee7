//! Test doubles for the runner, downloader and event sink.

use sha2::{Digest, Sha256};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

use crate::download::{DownloadError, Downloader};
use crate::runner::{CommandOutcome, CommandRunner, CommandSpec};
use crate::ui::prelude::*;

#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub level: Level,
    pub code: String,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

#[derive(Default)]
pub struct RecordingSink {
    pub events: RefCell<Vec<RecordedEvent>>,
}

impl RecordingSink {
    pub fn codes(&self) -> Vec<String> {
        self.events.borrow().iter().map(|e| e.code.clone()).collect()
    }

    pub fn with_level(&self, level: Level) -> Vec<RecordedEvent> {
        self.events
            .borrow()
            .iter()
            .filter(|e| e.level == level)
            .cloned()
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, level: Level, code: &str, message: &str, data: Option<serde_json::Value>) {
        self.events.borrow_mut().push(RecordedEvent {
            level,
            code: code.to_string(),
            message: message.to_string(),
            data,
        });
    }
}

type Handler = Box<dyn Fn(&CommandSpec) -> io::Result<CommandOutcome>>;

/// Records every command and answers with a scripted outcome.
pub struct FakeRunner {
    handler: Handler,
    calls: RefCell<Vec<CommandSpec>>,
}

impl FakeRunner {
    /// `handler` returns the exit code, or `None` for a signal death.
    pub fn new(handler: impl Fn(&CommandSpec) -> Option<i32> + 'static) -> Self {
        Self {
            handler: Box::new(move |spec| Ok(CommandOutcome { code: handler(spec) })),
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(|_| Some(0))
    }

    /// Every spawn fails as if the program were not installed.
    pub fn missing_program() -> Self {
        Self {
            handler: Box::new(|spec| {
                Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{} not found", spec.program_lossy()),
                ))
            }),
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.borrow().clone()
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, command: &CommandSpec) -> io::Result<CommandOutcome> {
        self.calls.borrow_mut().push(command.clone());
        (self.handler)(command)
    }
}

/// Serves fixed payloads by URL; unknown URLs answer 404.
#[derive(Default)]
pub struct FakeDownloader {
    payloads: HashMap<String, Vec<u8>>,
    calls: RefCell<Vec<String>>,
}

impl FakeDownloader {
    pub fn with_payload(mut self, url: &str, bytes: &[u8]) -> Self {
        self.payloads.insert(url.to_string(), bytes.to_vec());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }
}

impl Downloader for FakeDownloader {
    fn download(&self, url: &str, destination: &Path) -> Result<u64, DownloadError> {
        self.calls.borrow_mut().push(url.to_string());
        let bytes = self.payloads.get(url).ok_or_else(|| DownloadError::Status {
            url: url.to_string(),
            status: 404,
        })?;
        fs::write(destination, bytes)?;
        Ok(bytes.len() as u64)
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// The argument following `flag` in `spec`.
pub fn arg_after(spec: &CommandSpec, flag: &str) -> Option<String> {
    let position = spec.flag_position(flag)?;
    spec.args
        .get(position + 1)
        .map(|a| a.to_string_lossy().into_owned())
}
