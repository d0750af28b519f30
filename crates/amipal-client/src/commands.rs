//! Typed wrappers over [`Controller::query`] for the common manager actions.

use crate::controller::Controller;
use crate::error::AmiError;
use crate::query::{CommandArgs, QueryOutcome};
use std::collections::BTreeSet;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Originate {
    pub channel: String,
    pub exten: Option<String>,
    pub context: Option<String>,
    pub priority: Option<String>,
    pub application: Option<String>,
    pub data: Option<String>,
    pub timeout: Option<Duration>,
    pub caller_id: Option<String>,
    pub variables: Vec<(String, String)>,
    pub account: Option<String>,
    pub run_async: bool,
}

impl Originate {
    /// Dial `channel` and drop it into `exten@context`, priority 1.
    pub fn to_extension(channel: &str, exten: &str, context: &str) -> Self {
        Self {
            channel: channel.to_string(),
            exten: Some(exten.to_string()),
            context: Some(context.to_string()),
            priority: Some("1".to_string()),
            ..Self::default()
        }
    }

    fn to_args(&self) -> CommandArgs {
        let mut args = CommandArgs::default().with("Channel", self.channel.as_str());
        let optional = [
            ("Exten", &self.exten),
            ("Context", &self.context),
            ("Priority", &self.priority),
            ("Application", &self.application),
            ("Data", &self.data),
            ("CallerID", &self.caller_id),
            ("Account", &self.account),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                args = args.with(key, value.as_str());
            }
        }
        if let Some(timeout) = self.timeout {
            args = args.with("Timeout", timeout.as_millis().to_string());
        }
        if !self.variables.is_empty() {
            let joined = self
                .variables
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join(",");
            args = args.with("Variable", joined);
        }
        if self.run_async {
            args = args.with("Async", "true");
        }
        args
    }
}

impl Controller {
    pub async fn ping(&self) -> Result<QueryOutcome, AmiError> {
        self.query("Ping", CommandArgs::default()).await
    }

    pub async fn list_commands(&self) -> Result<QueryOutcome, AmiError> {
        self.query("ListCommands", CommandArgs::default()).await
    }

    pub async fn sip_peers(&self) -> Result<QueryOutcome, AmiError> {
        self.query("SIPpeers", CommandArgs::default()).await
    }

    pub async fn sip_show_registry(&self) -> Result<QueryOutcome, AmiError> {
        self.query("SIPshowregistry", CommandArgs::default()).await
    }

    pub async fn sip_show_peer(&self, peer: &str) -> Result<QueryOutcome, AmiError> {
        self.query("SIPshowpeer", CommandArgs::positional([peer])).await
    }

    pub async fn show_dial_plan(
        &self,
        context: Option<&str>,
        extension: Option<&str>,
    ) -> Result<QueryOutcome, AmiError> {
        let mut args = CommandArgs::default();
        if let Some(context) = context {
            args = args.with("Context", context);
        }
        if let Some(extension) = extension {
            args = args.with("Extension", extension);
        }
        self.query("ShowDialPlan", args).await
    }

    /// Sorted, de-duplicated context names from the full dialplan listing.
    pub async fn dialplan_contexts(&self) -> Result<Vec<String>, AmiError> {
        let outcome = self.show_dial_plan(None, None).await?;
        let contexts = outcome
            .items("ListDialplan")
            .filter_map(|event| event.get("Context"))
            .filter(|context| !context.is_empty())
            .map(str::to_string)
            .collect::<BTreeSet<_>>();
        Ok(contexts.into_iter().collect())
    }

    pub async fn originate(&self, request: &Originate) -> Result<QueryOutcome, AmiError> {
        self.query("Originate", request.to_args()).await
    }

    pub async fn hangup(&self, channel: &str, cause: Option<u16>) -> Result<QueryOutcome, AmiError> {
        let mut args = CommandArgs::default().with("Channel", channel);
        if let Some(cause) = cause {
            args = args.with("Cause", cause.to_string());
        }
        self.query("Hangup", args).await
    }

    pub async fn redirect(
        &self,
        channel: &str,
        exten: &str,
        context: &str,
        priority: &str,
    ) -> Result<QueryOutcome, AmiError> {
        self.query(
            "Redirect",
            CommandArgs::positional([channel, exten, context, priority]),
        )
        .await
    }

    pub async fn status(&self, channel: Option<&str>) -> Result<QueryOutcome, AmiError> {
        let args = match channel {
            Some(channel) => CommandArgs::default().with("Channel", channel),
            None => CommandArgs::default(),
        };
        self.query("Status", args).await
    }

    pub async fn core_show_channels(&self) -> Result<QueryOutcome, AmiError> {
        self.query("CoreShowChannels", CommandArgs::default()).await
    }

    pub async fn core_status(&self) -> Result<QueryOutcome, AmiError> {
        self.query("CoreStatus", CommandArgs::default()).await
    }

    pub async fn parked_calls(&self) -> Result<QueryOutcome, AmiError> {
        self.query("ParkedCalls", CommandArgs::default()).await
    }

    pub async fn agents(&self) -> Result<QueryOutcome, AmiError> {
        self.query("Agents", CommandArgs::default()).await
    }

    pub async fn get_config(&self, filename: &str, category: Option<&str>) -> Result<QueryOutcome, AmiError> {
        let mut args = CommandArgs::default().with("Filename", filename);
        if let Some(category) = category {
            args = args.with("Category", category);
        }
        self.query("GetConfig", args).await
    }
}
