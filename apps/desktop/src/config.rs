use std::{collections::HashMap, fs};

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub server_url: String,
    pub token: Option<String>,
    pub token_file: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            token: None,
            token_file: None,
        }
    }
}

/// Defaults, overridden by `client.toml`, overridden by environment.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("client.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("server_url") {
                settings.server_url = v.clone();
            }
            if let Some(v) = file_cfg.get("token") {
                settings.token = Some(v.clone());
            }
            if let Some(v) = file_cfg.get("token_file") {
                settings.token_file = Some(v.clone());
            }
        }
    }

    if let Ok(v) = std::env::var("APP__SERVER_URL") {
        settings.server_url = v;
    }
    if let Ok(v) = std::env::var("APP__TOKEN") {
        settings.token = Some(v);
    }
    if let Ok(v) = std::env::var("APP__TOKEN_FILE") {
        settings.token_file = Some(v);
    }

    settings
}
