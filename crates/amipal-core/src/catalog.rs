use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Argument shape of one manager action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionSpec {
    pub name: String,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub optional: Vec<String>,
    /// Event that closes a list response for this action.
    #[serde(default)]
    pub sentinel: Option<String>,
}

impl ActionSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            required: Vec::new(),
            optional: Vec::new(),
            sentinel: None,
        }
    }

    pub fn required(mut self, names: &[&str]) -> Self {
        self.required = names.iter().map(|name| name.to_string()).collect();
        self
    }

    pub fn optional(mut self, names: &[&str]) -> Self {
        self.optional = names.iter().map(|name| name.to_string()).collect();
        self
    }

    pub fn sentinel(mut self, event: &str) -> Self {
        self.sentinel = Some(event.to_string());
        self
    }

    pub fn accepts(&self, key: &str) -> bool {
        self.required.iter().chain(self.optional.iter()).any(|name| name == key)
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    actions: Vec<ActionSpec>,
    #[serde(default)]
    events: Vec<String>,
}

/// Known action shapes and known event names.
///
/// The event list drives classification: a name missing from it lands in
/// the alien bucket.
#[derive(Debug, Clone)]
pub struct ActionCatalog {
    actions: BTreeMap<String, ActionSpec>,
    events: BTreeSet<String>,
}

impl ActionCatalog {
    pub fn empty() -> Self {
        Self {
            actions: BTreeMap::new(),
            events: BTreeSet::new(),
        }
    }

    /// Loads a catalog from JSON of the form
    /// `{"actions": [{"name": .., "required": [..], "optional": [..], "sentinel": ..}], "events": [..]}`.
    ///
    /// Sentinels are registered as known events.
    pub fn from_json(raw: &str) -> Result<Self, ProtocolError> {
        let file: CatalogFile = serde_json::from_str(raw)
            .map_err(|err| ProtocolError::InvalidInput(format!("catalog: {err}")))?;
        let mut catalog = Self::empty();
        for action in file.actions {
            if action.name.trim().is_empty() {
                return Err(ProtocolError::InvalidInput(
                    "catalog: action name cannot be empty".to_string(),
                ));
            }
            catalog.insert_action(action);
        }
        for event in file.events {
            catalog.insert_event(&event);
        }
        Ok(catalog)
    }

    pub fn insert_action(&mut self, spec: ActionSpec) {
        if let Some(sentinel) = &spec.sentinel {
            self.events.insert(sentinel.clone());
        }
        self.actions.insert(spec.name.clone(), spec);
    }

    pub fn insert_event(&mut self, name: &str) {
        let name = name.trim();
        if !name.is_empty() {
            self.events.insert(name.to_string());
        }
    }

    pub fn action(&self, name: &str) -> Option<&ActionSpec> {
        self.actions.get(name)
    }

    pub fn actions(&self) -> impl Iterator<Item = &ActionSpec> {
        self.actions.values()
    }

    pub fn sentinel_for(&self, action: &str) -> Option<&str> {
        self.actions
            .get(action)
            .and_then(|spec| spec.sentinel.as_deref())
    }

    pub fn is_known(&self, event: &str) -> bool {
        self.events.contains(event)
    }

    pub fn events(&self) -> impl Iterator<Item = &str> {
        self.events.iter().map(String::as_str)
    }
}

const KNOWN_EVENTS: &[&str] = &[
    "AgentCalled",
    "AgentComplete",
    "AgentConnect",
    "AgentDump",
    "Agentlogin",
    "Agentlogoff",
    "Agents",
    "Alarm",
    "AlarmClear",
    "Bridge",
    "ChannelUpdate",
    "ContactStatus",
    "CoreShowChannel",
    "DAHDIChannel",
    "DNDState",
    "Dial",
    "DialBegin",
    "DialEnd",
    "DTMF",
    "DTMFBegin",
    "DTMFEnd",
    "ExtensionStatus",
    "FullyBooted",
    "Hangup",
    "HangupRequest",
    "Hold",
    "Join",
    "Leave",
    "ListDialplan",
    "LocalBridge",
    "MeetmeJoin",
    "MeetmeLeave",
    "MessageWaiting",
    "MusicOnHold",
    "NewAccountCode",
    "NewCallerid",
    "Newchannel",
    "Newexten",
    "Newstate",
    "OriginateResponse",
    "ParkedCall",
    "ParkedCallGiveUp",
    "ParkedCallTimeOut",
    "PeerEntry",
    "PeerStatus",
    "QueueMemberStatus",
    "RegistryEntry",
    "Registry",
    "Reload",
    "Rename",
    "RTCPReceived",
    "RTCPSent",
    "Shutdown",
    "SoftHangupRequest",
    "Status",
    "SuccessfulAuth",
    "Transfer",
    "Unhold",
    "Unlink",
    "UserEvent",
    "VarSet",
];

impl Default for ActionCatalog {
    /// Built-in table of the common manager actions.
    fn default() -> Self {
        let mut catalog = Self::empty();
        let actions = [
            ActionSpec::new("Login").required(&["Username", "Secret"]),
            ActionSpec::new("Logoff"),
            ActionSpec::new("Ping"),
            ActionSpec::new("ListCommands"),
            ActionSpec::new("SIPshowregistry").sentinel("RegistrationsComplete"),
            ActionSpec::new("SIPpeers").sentinel("PeerlistComplete"),
            ActionSpec::new("SIPshowpeer").required(&["Peer"]),
            ActionSpec::new("SIPqualifypeer").required(&["Peer"]),
            ActionSpec::new("ShowDialPlan")
                .optional(&["Extension", "Context"])
                .sentinel("ShowDialPlanComplete"),
            ActionSpec::new("Originate").required(&["Channel"]).optional(&[
                "Exten",
                "Context",
                "Priority",
                "Application",
                "Data",
                "Timeout",
                "CallerID",
                "Variable",
                "Account",
                "Async",
                "Codecs",
            ]),
            ActionSpec::new("Hangup")
                .required(&["Channel"])
                .optional(&["Cause"]),
            ActionSpec::new("Redirect")
                .required(&["Channel", "Exten", "Context", "Priority"])
                .optional(&["ExtraChannel", "ExtraExten", "ExtraContext", "ExtraPriority"]),
            ActionSpec::new("Atxfer").required(&["Channel", "Exten", "Context", "Priority"]),
            ActionSpec::new("PlayDTMF").required(&["Channel", "Digit"]),
            ActionSpec::new("Bridge")
                .required(&["Channel1", "Channel2"])
                .optional(&["Tone"]),
            ActionSpec::new("Park")
                .required(&["Channel", "Channel2"])
                .optional(&["Timeout", "Parkinglot"]),
            ActionSpec::new("ParkedCalls").sentinel("ParkedCallsComplete"),
            ActionSpec::new("Queues"),
            ActionSpec::new("Agents").sentinel("AgentsComplete"),
            ActionSpec::new("CoreShowChannels").sentinel("CoreShowChannelsComplete"),
            ActionSpec::new("CoreStatus"),
            ActionSpec::new("CoreSettings"),
            ActionSpec::new("Status")
                .optional(&["Channel", "Variables"])
                .sentinel("StatusComplete"),
            ActionSpec::new("GetConfig")
                .required(&["Filename"])
                .optional(&["Category"]),
            ActionSpec::new("GetConfigJSON").required(&["Filename"]),
        ];
        for action in actions {
            catalog.insert_action(action);
        }
        for event in KNOWN_EVENTS {
            catalog.insert_event(event);
        }
        catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_table_covers_list_actions() {
        let catalog = ActionCatalog::default();
        assert_eq!(catalog.sentinel_for("SIPpeers"), Some("PeerlistComplete"));
        assert_eq!(catalog.sentinel_for("Ping"), None);
        assert!(catalog.is_known("PeerlistComplete"));
        assert!(catalog.is_known("PeerEntry"));
        assert!(!catalog.is_known("ZzzCustom"));

        let redirect = catalog.action("Redirect").expect("redirect");
        assert_eq!(redirect.required, vec!["Channel", "Exten", "Context", "Priority"]);
        assert!(redirect.accepts("ExtraChannel"));
        assert!(!redirect.accepts("Cause"));
    }

    #[test]
    fn json_catalog_registers_sentinels_as_events() {
        let catalog = ActionCatalog::from_json(
            r#"{
                "actions": [{"name": "QueueStatus", "optional": ["Queue"], "sentinel": "QueueStatusComplete"}],
                "events": ["QueueParams", " "]
            }"#,
        )
        .expect("catalog");
        assert_eq!(catalog.actions().count(), 1);
        assert!(catalog.is_known("QueueStatusComplete"));
        assert!(catalog.is_known("QueueParams"));
        assert_eq!(catalog.events().count(), 2);
        assert!(catalog.action("QueueStatus").expect("action").required.is_empty());
    }

    #[test]
    fn json_catalog_rejects_blank_names_and_bad_json() {
        assert!(matches!(
            ActionCatalog::from_json(r#"{"actions": [{"name": "  "}]}"#),
            Err(ProtocolError::InvalidInput(_))
        ));
        assert!(matches!(
            ActionCatalog::from_json("not json"),
            Err(ProtocolError::InvalidInput(_))
        ));
    }
}
