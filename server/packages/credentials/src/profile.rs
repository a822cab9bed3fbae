use std::collections::HashMap;
use std::path::PathBuf;

/// One `[section]` of a shared credentials file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Profile {
    pub values: HashMap<String, String>,
}

impl Profile {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// `AWS_SHARED_CREDENTIALS_FILE`, else `~/.aws/credentials`.
pub fn default_credentials_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os("AWS_SHARED_CREDENTIALS_FILE") {
        return Some(PathBuf::from(path));
    }
    dirs::home_dir().map(|home| home.join(".aws").join("credentials"))
}

/// Parse INI-style profiles. `[profile name]` and `[name]` headers are
/// equivalent; comments start with `#` or `;`. Keys are lowercased.
pub fn parse_profiles(contents: &str) -> HashMap<String, Profile> {
    let mut profiles: HashMap<String, Profile> = HashMap::new();
    let mut current: Option<String> = None;
    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(header) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
            let header = header.trim();
            let name = header.strip_prefix("profile ").unwrap_or(header).trim();
            profiles.entry(name.to_string()).or_default();
            current = Some(name.to_string());
            continue;
        }
        let (Some(section), Some((key, value))) = (&current, line.split_once('=')) else {
            continue;
        };
        if let Some(profile) = profiles.get_mut(section) {
            profile
                .values
                .insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    profiles
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sections_and_ignores_noise() {
        let profiles = parse_profiles(
            "# shared file\n\
             orphan = 1\n\
             [default]\n\
             aws_access_key_id = AKIDDEFAULT\n\
             \n\
             [profile bedrock]\n\
             AWS_Access_Key_Id=AKIDBEDROCK\n\
             aws_secret_access_key = s3cr=t\n\
             ; trailing comment\n",
        );
        assert_eq!(profiles.len(), 2);
        assert_eq!(profiles["default"].get("aws_access_key_id"), Some("AKIDDEFAULT"));
        let bedrock = &profiles["bedrock"];
        assert_eq!(bedrock.get("aws_access_key_id"), Some("AKIDBEDROCK"));
        assert_eq!(bedrock.get("aws_secret_access_key"), Some("s3cr=t"));
    }
}
