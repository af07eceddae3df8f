use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::aggregate::StudentLocks;
use crate::bank::AnswerKeyConfig;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub key_config: AnswerKeyConfig,
    pub locks: StudentLocks,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            workspace: None,
            db: None,
            key_config: AnswerKeyConfig::default(),
            locks: StudentLocks::new(),
        }
    }
}
