pub const APP_NAME: &str = "textboard_backend";

/// `User-Agent` sent to external filter services.
pub fn user_agent() -> String {
    format!("{APP_NAME}/{}", env!("CARGO_PKG_VERSION"))
}
