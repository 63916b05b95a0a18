//! Test fixtures.
//!
//! Builds temp-dir backends seeded with a template session, a shared
//! character, and a hand-written entropy stream with known pools so roll
//! totals are predictable.

use std::fs;
use std::path::Path;

use serde_json::json;
use tempfile::TempDir;

use crate::config::{Settings, StorageBackendKind};
use crate::core::events::UpdateBus;
use crate::core::llm::LlmClient;
use crate::core::roll::RollService;
use crate::core::turn::TurnEngine;
use crate::storage::file::FileStorage;
use crate::storage::sqlite::SqliteStorage;
use crate::storage::SharedStorage;

pub const TEMPLATE_SLUG: &str = "example-rogue";

/// First d20 value of every fixture entropy entry.
pub const FIRST_D20: u32 = 10;

/// A backend rooted in its own temp directory. Keep the `TempDir` alive
/// for the duration of the test.
pub struct TestBackend {
    pub storage: SharedStorage,
    pub settings: Settings,
    pub bus: UpdateBus,
    _temp: TempDir,
}

impl TestBackend {
    pub fn engine(&self) -> TurnEngine {
        TurnEngine::new(self.storage.clone(), self.bus.clone(), self.settings.clone())
    }

    pub fn rolls(&self) -> RollService {
        RollService::new(self.storage.clone(), self.bus.clone())
    }

    /// Unconfigured client; narration falls back deterministically.
    pub fn llm(&self) -> LlmClient {
        LlmClient::new(self.settings.llm.clone())
    }

    pub fn data_root(&self) -> &Path {
        &self.settings.data_root
    }
}

fn template_state() -> serde_json::Value {
    json!({
        "character": TEMPLATE_SLUG,
        "turn": 0,
        "log_index": 0,
        "scene_id": "start",
        "location": "",
        "hp": 10,
        "max_hp": 10,
        "ac": 13,
        "conditions": [],
        "inventory": ["dagger"],
        "flags": {},
        "level": 1,
        "xp": 0,
        "gp": 10,
        "abilities": {"str": 10, "dex": 14, "con": 12, "int": 10, "wis": 10, "cha": 8}
    })
}

fn template_character() -> serde_json::Value {
    json!({
        "slug": TEMPLATE_SLUG,
        "name": "Rin",
        "level": 1,
        "hp": 10,
        "ac": 13,
        "abilities": {"str": 10, "dex": 14, "con": 12, "int": 10, "wis": 10, "cha": 8},
        "inventory": ["dagger"],
        "proficiencies": {"skills": ["Stealth"]}
    })
}

/// Hand-written entries with fixed pools: first d20 is always 10, second
/// 4 (so advantage picks 10, disadvantage 4), first d100 is 55.
pub fn write_entropy_file(data_root: &Path, count: u64) {
    let dice_dir = data_root.join("dice");
    fs::create_dir_all(&dice_dir).expect("create dice dir");
    let mut body = String::new();
    for i in 1..=count {
        let entry = json!({
            "i": i,
            "d20": [10, 4, 17, 1, 9, 12, 3, 18, 6, 11],
            "d100": [55, 3, 97, 41, 72],
            "bytes": format!("{i:08x}"),
        });
        body.push_str(&entry.to_string());
        body.push('\n');
    }
    fs::write(dice_dir.join("entropy.ndjson"), body).expect("write entropy file");
}

fn seed_data_root(data_root: &Path, entropy_entries: u64) {
    let template_dir = data_root.join("sessions").join(TEMPLATE_SLUG);
    fs::create_dir_all(&template_dir).expect("create template dir");
    fs::write(
        template_dir.join("state.json"),
        serde_json::to_string_pretty(&template_state()).expect("serialize template state"),
    )
    .expect("write template state");

    let characters_dir = data_root.join("data").join("characters");
    fs::create_dir_all(&characters_dir).expect("create characters dir");
    fs::write(
        characters_dir.join(format!("{TEMPLATE_SLUG}.json")),
        serde_json::to_string_pretty(&template_character()).expect("serialize character"),
    )
    .expect("write template character");

    write_entropy_file(data_root, entropy_entries);
}

fn base_settings(temp: &TempDir, backend: StorageBackendKind) -> Settings {
    let mut settings = Settings::default();
    settings.backend = backend;
    settings.data_root = temp.path().to_path_buf();
    settings.auto_save_secs = 0;
    settings
}

/// File backend with a seeded template and `entropy_entries` of stream.
pub async fn file_backend_with(entropy_entries: u64) -> TestBackend {
    let temp = TempDir::new().expect("tempdir");
    seed_data_root(temp.path(), entropy_entries);
    let settings = base_settings(&temp, StorageBackendKind::File);
    TestBackend {
        storage: std::sync::Arc::new(FileStorage::new(settings.clone())),
        settings,
        bus: UpdateBus::new(),
        _temp: temp,
    }
}

pub async fn file_backend() -> TestBackend {
    file_backend_with(10).await
}

/// SQLite backend with the same seed.
pub async fn sqlite_backend() -> TestBackend {
    let temp = TempDir::new().expect("tempdir");
    seed_data_root(temp.path(), 10);
    let settings = base_settings(&temp, StorageBackendKind::Sqlite);
    let storage = SqliteStorage::connect(settings.clone())
        .await
        .expect("connect sqlite");
    TestBackend {
        storage: std::sync::Arc::new(storage),
        settings,
        bus: UpdateBus::new(),
        _temp: temp,
    }
}

/// Both backends, for contract-equivalence sweeps.
pub async fn both_backends() -> Vec<TestBackend> {
    vec![file_backend().await, sqlite_backend().await]
}

/// Create a session from the template and claim its lock for `owner`.
pub async fn locked_session(backend: &TestBackend, slug: &str, owner: &str) {
    backend
        .storage
        .create_session(slug, TEMPLATE_SLUG)
        .await
        .expect("create session");
    backend
        .storage
        .claim_lock(slug, owner, 300)
        .await
        .expect("claim lock");
}
