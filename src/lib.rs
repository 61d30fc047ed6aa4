pub mod client;
pub mod config;
pub mod control;
pub mod crypto;
pub mod datagen;
pub mod engine;
pub mod holder;
pub mod message;
pub mod relation;
pub mod salt;
pub mod session;
pub mod stats;
pub mod traits;
pub mod utils;
pub mod verify;

pub const CONFIG_PATH: &str = "./config/simulation.config.json";
pub const SEED: u64 = 1413265736543;

// result rows per fragment sent by the computation layer
pub const MAX_FRAGMENT_SIZE: usize = 1000;
pub const SALT_WAIT_TIMEOUT_MS: u64 = 30_000;

pub const FIELD_SEP: char = '|';
pub const TID_SEP: char = '-';
pub const TWIN_SALT_SEP: char = '-';
pub const TWIN_SALT_RETRY_SEP: char = '_';
pub const BUCKET_SALT_SEP: &str = "%%";
pub const MARKER_PREFIX: &str = "marker_";
pub const MARKER_ID_SUFFIX: &str = "_m";
pub const DUMMY: &str = "dummy";

pub const HOLDER_L: &str = "L";
pub const HOLDER_R: &str = "R";
