//! Classification tables: campaign-name rules for network rows, the app id to
//! client mapping for attribution rows, and the attribution event taxonomy.

use std::fmt;
use std::str::FromStr;

/// Label given to network rows whose campaign name matches no rule.
pub const DEFAULT_CLIENT: &str = "Other";

const DEFAULT_CLIENT_RULES: &[(&str, &str)] = &[
    ("client1", "liga_stavok"),
    ("client2", "betboom"),
    ("client3", "winline"),
];

const DEFAULT_APP_CLIENTS: &[(&str, &str)] = &[
    ("app1", "client1"),
    ("app2", "client2"),
    ("app3", "client3"),
];

/// A `pattern=label` pair. The pattern is matched as a case-insensitive
/// substring of the campaign name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRule {
    pattern: String,
    label: String,
}

impl ClientRule {
    pub fn new(pattern: &str, label: &str) -> Self {
        ClientRule {
            pattern: pattern.to_lowercase(),
            label: label.to_string(),
        }
    }

    fn matches(&self, campaign_lowercase: &str) -> bool {
        campaign_lowercase.contains(&self.pattern)
    }
}

impl FromStr for ClientRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((pattern, label)) if !pattern.trim().is_empty() && !label.trim().is_empty() => {
                Ok(ClientRule::new(pattern.trim(), label.trim()))
            }
            _ => Err(format!("Invalid client rule '{s}', expected PATTERN=LABEL")),
        }
    }
}

impl fmt::Display for ClientRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.pattern, self.label)
    }
}

/// Ordered campaign-name rules, evaluated first match wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRules {
    rules: Vec<ClientRule>,
}

impl ClientRules {
    pub fn new(rules: Vec<ClientRule>) -> Self {
        ClientRules { rules }
    }

    /// Uses the configured rules, or the built-in table when none were given.
    pub fn from_config(rules: &[ClientRule]) -> Self {
        if rules.is_empty() {
            Self::default()
        } else {
            Self::new(rules.to_vec())
        }
    }

    pub fn classify(&self, campaign: &str) -> Option<&str> {
        let campaign = campaign.to_lowercase();
        self.rules
            .iter()
            .find(|rule| rule.matches(&campaign))
            .map(|rule| rule.label.as_str())
    }

    pub fn classify_or_default(&self, campaign: &str) -> &str {
        self.classify(campaign).unwrap_or(DEFAULT_CLIENT)
    }
}

impl fmt::Display for ClientRules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, rule) in self.rules.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{rule}")?;
        }
        Ok(())
    }
}

impl Default for ClientRules {
    fn default() -> Self {
        ClientRules::new(
            DEFAULT_CLIENT_RULES
                .iter()
                .map(|(pattern, label)| ClientRule::new(pattern, label))
                .collect(),
        )
    }
}

/// An `app_id=client` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppClient {
    pub app_id: String,
    pub client: String,
}

impl FromStr for AppClient {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((app_id, client)) if !app_id.trim().is_empty() && !client.trim().is_empty() => {
                Ok(AppClient {
                    app_id: app_id.trim().to_string(),
                    client: client.trim().to_string(),
                })
            }
            _ => Err(format!("Invalid app client '{s}', expected APP_ID=CLIENT")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppClients {
    entries: Vec<AppClient>,
}

impl AppClients {
    pub fn from_config(entries: &[AppClient]) -> Self {
        if entries.is_empty() {
            Self::default()
        } else {
            AppClients {
                entries: entries.to_vec(),
            }
        }
    }

    pub fn client_for(&self, app_id: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|entry| entry.app_id == app_id)
            .map(|entry| entry.client.as_str())
    }
}

impl Default for AppClients {
    fn default() -> Self {
        AppClients {
            entries: DEFAULT_APP_CLIENTS
                .iter()
                .map(|(app_id, client)| AppClient {
                    app_id: app_id.to_string(),
                    client: client.to_string(),
                })
                .collect(),
        }
    }
}

/// Attribution events kept by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Register,
    Deposit,
    Install,
}

impl EventKind {
    /// Maps a raw platform event name onto the taxonomy. Anything else is
    /// not tracked and yields `None`.
    pub fn normalize(raw: &str) -> Option<Self> {
        match raw.trim() {
            "register" | "conversionStep_[1]_success" => Some(EventKind::Register),
            "ftt" | "ftd1" => Some(EventKind::Deposit),
            "install" => Some(EventKind::Install),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Register => "register",
            EventKind::Deposit => "deposit",
            EventKind::Install => "install",
        }
    }
}
