/*!
Typed read access to the per-user settings object. Settings are stored as
one JSON blob (whole-object save from the client); this view decodes the
fields the engine itself consults.
*/

use serde_json::Value;

/// Features an AI profile can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiFeature {
    Translation,
    Summary,
    Chat,
    Search,
}

impl AiFeature {
    pub fn key(self) -> &'static str {
        match self {
            AiFeature::Translation => "translation",
            AiFeature::Summary => "summary",
            AiFeature::Chat => "chat",
            AiFeature::Search => "search",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SettingsView(Value);

impl SettingsView {
    pub fn new(value: Value) -> Self {
        SettingsView(value)
    }

    pub fn raw(&self) -> &Value {
        &self.0
    }

    fn get<'a>(&'a self, path: &[&str]) -> Option<&'a Value> {
        let mut cur = &self.0;
        for key in path {
            cur = cur.get(key)?;
        }
        Some(cur)
    }

    fn bool_at(&self, path: &[&str]) -> bool {
        self.get(path).and_then(Value::as_bool).unwrap_or(false)
    }

    fn str_at(&self, path: &[&str]) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    pub fn auto_translate(&self) -> bool {
        self.bool_at(&["auto_translate"])
    }

    pub fn auto_summary(&self) -> bool {
        self.bool_at(&["auto_summary"])
    }

    pub fn target_lang(&self) -> Option<&str> {
        self.str_at(&["target_language"])
    }

    /// Profile id bound to a feature, when the user picked one.
    pub fn ai_profile_for(&self, feature: AiFeature) -> Option<i64> {
        self.get(&["ai_profiles", feature.key()])
            .and_then(Value::as_i64)
    }

    // ---- external aggregator sync ----

    pub fn sync_enabled(&self) -> bool {
        self.bool_at(&["sync", "enabled"])
    }

    pub fn sync_endpoint(&self) -> Option<&str> {
        self.str_at(&["sync", "endpoint"])
    }

    pub fn sync_username(&self) -> Option<&str> {
        self.str_at(&["sync", "username"])
    }

    pub fn sync_password_enc(&self) -> Option<&str> {
        self.str_at(&["sync", "password_enc"])
    }

    pub fn sync_proxy(&self) -> Option<&str> {
        self.str_at(&["sync", "proxy"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_nested_fields_with_defaults() {
        let view = SettingsView::new(serde_json::json!({
            "auto_translate": true,
            "target_language": "en",
            "ai_profiles": { "translation": 3 },
            "sync": { "enabled": true, "endpoint": "https://rss.example.com/api/greader.php" }
        }));
        assert!(view.auto_translate());
        assert!(!view.auto_summary());
        assert_eq!(view.target_lang(), Some("en"));
        assert_eq!(view.ai_profile_for(AiFeature::Translation), Some(3));
        assert_eq!(view.ai_profile_for(AiFeature::Summary), None);
        assert!(view.sync_enabled());

        let empty = SettingsView::new(serde_json::json!({}));
        assert!(!empty.auto_translate());
        assert!(!empty.sync_enabled());
    }
}
