use crate::settings::{RunSettings, ServerSettings, Settings};

pub(crate) fn settings(enabled: bool) -> Settings {
    settings_for("http://localhost", enabled)
}

pub(crate) fn settings_for(hostname: &str, enabled: bool) -> Settings {
    Settings {
        enabled,
        project_key: "DEF".to_string(),
        send_logs: true,
        server: ServerSettings {
            hostname: hostname.to_string(),
            access_token: "token".to_string(),
        },
        run: RunSettings::default(),
        notification: None,
        milestone: None,
        zebrunner: None,
    }
}
