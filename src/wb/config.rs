use crate::config::env_string;
use once_cell::sync::Lazy;

pub static MARKETPLACE_ROOT: Lazy<String> = Lazy::new(|| {
    root_from_env("WB_MARKETPLACE_URL", "https://marketplace-api.wildberries.ru")
});

pub static CONTENT_ROOT: Lazy<String> =
    Lazy::new(|| root_from_env("WB_CONTENT_URL", "https://content-api.wildberries.ru"));

fn root_from_env(key: &str, default: &str) -> String {
    env_string(key)
        .unwrap_or_else(|| default.to_string())
        .trim_end_matches('/')
        .to_string()
}
