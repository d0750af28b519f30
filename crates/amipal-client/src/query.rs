use crate::controller::Controller;
use crate::error::{AmiError, ArgumentError};
use amipal_core::{ActionSpec, Event};
use std::collections::BTreeMap;
use tracing::debug;

/// Arguments for one action, either bound by position against the action's
/// required fields or given by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandArgs {
    pub positional: Vec<String>,
    pub keyword: BTreeMap<String, String>,
}

impl CommandArgs {
    pub fn positional<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            positional: values.into_iter().map(Into::into).collect(),
            keyword: BTreeMap::new(),
        }
    }

    pub fn keyword<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            positional: Vec::new(),
            keyword: pairs
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.keyword.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keyword.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryOutcome {
    pub action_id: String,
    pub events: Vec<Event>,
    pub complete: bool,
}

impl QueryOutcome {
    pub fn response(&self) -> Option<&Event> {
        self.events.iter().find(|event| event.is_response())
    }

    pub fn is_success(&self) -> bool {
        self.response()
            .and_then(Event::response)
            .map_or(false, |value| value.eq_ignore_ascii_case("success"))
    }

    /// Events named `name`, in arrival order.
    pub fn items<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Event> + 'a {
        self.events
            .iter()
            .filter(move |event| event.name() == Some(name))
    }
}

/// Validates `args` against `spec` and returns the header pairs to encode.
///
/// Only the catalogued required and optional keys reach the wire, in catalog
/// order; empty values and unlisted keys are dropped. Without a spec only
/// keyword arguments are accepted and forwarded as given.
pub fn build_arguments(
    action: &str,
    spec: Option<&ActionSpec>,
    args: &CommandArgs,
) -> Result<Vec<(String, String)>, ArgumentError> {
    let Some(spec) = spec else {
        if !args.positional.is_empty() {
            return Err(ArgumentError::UnknownAction(action.to_string()));
        }
        return Ok(args
            .keyword
            .iter()
            .filter(|(_, value)| !value.is_empty())
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect());
    };

    if !spec.required.is_empty() && args.is_empty() {
        return Err(ArgumentError::MissingRequired {
            action: spec.name.clone(),
            required: spec.required.clone(),
        });
    }
    if !args.positional.is_empty() && !args.keyword.is_empty() {
        return Err(ArgumentError::MixedArguments {
            action: spec.name.clone(),
        });
    }

    if !args.positional.is_empty() {
        if args.positional.len() != spec.required.len() {
            return Err(ArgumentError::PositionalCount {
                action: spec.name.clone(),
                expected: spec.required.len(),
                found: args.positional.len(),
            });
        }
        return Ok(spec
            .required
            .iter()
            .zip(args.positional.iter())
            .filter(|(_, value)| !value.is_empty())
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect());
    }

    let missing = spec
        .required
        .iter()
        .filter(|name| !args.keyword.contains_key(name.as_str()))
        .cloned()
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        return Err(ArgumentError::MissingRequired {
            action: spec.name.clone(),
            required: missing,
        });
    }

    let mut fields = Vec::new();
    for name in spec.required.iter().chain(spec.optional.iter()) {
        if let Some(value) = args.keyword.get(name) {
            if !value.is_empty() {
                fields.push((name.clone(), value.clone()));
            }
        }
    }
    for key in args.keyword.keys().filter(|key| !spec.accepts(key)) {
        debug!(event = "ami_argument_dropped", action = %spec.name, key = %key);
    }
    Ok(fields)
}

impl Controller {
    /// Runs one catalogued action and waits for its correlated events.
    ///
    /// Argument errors surface before anything is queued. Actions with a
    /// catalogued sentinel wait for the list to close.
    pub async fn query(&self, action: &str, args: CommandArgs) -> Result<QueryOutcome, AmiError> {
        let action = action.trim();
        if action.is_empty() {
            return Err(ArgumentError::EmptyAction.into());
        }
        let spec = self.catalog().action(action);
        let fields = build_arguments(action, spec, &args)?;
        let sentinel = spec.and_then(|spec| spec.sentinel.clone());
        let fields = fields
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
            .collect::<Vec<_>>();
        self.query_raw(action, &fields, sentinel.as_deref()).await
    }

    /// Sends `fields` unchecked and waits with an explicit sentinel.
    pub async fn query_raw(
        &self,
        action: &str,
        fields: &[(&str, &str)],
        sentinel: Option<&str>,
    ) -> Result<QueryOutcome, AmiError> {
        let action_id = self.cmd(action, fields).await?;
        let config = self.config();
        let outcome = self
            .wait_for(&action_id, sentinel, config.wait_budget, config.wait_poll)
            .await;
        debug!(
            event = "ami_query_done",
            action = %action,
            action_id = %action_id,
            events = outcome.events.len(),
            complete = outcome.complete
        );
        Ok(QueryOutcome {
            action_id,
            events: outcome.events,
            complete: outcome.complete,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use crate::fake_ami::FakeAmi;
    use amipal_core::ActionCatalog;
    use std::time::Duration;

    fn fields(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    fn redirect() -> ActionSpec {
        ActionCatalog::default()
            .action("Redirect")
            .cloned()
            .expect("redirect spec")
    }

    #[test]
    fn required_fields_must_be_supplied() {
        let err = build_arguments("Redirect", Some(&redirect()), &CommandArgs::default())
            .expect_err("missing");
        assert!(matches!(err, ArgumentError::MissingRequired { ref required, .. } if required.len() == 4));

        let err = build_arguments(
            "Redirect",
            Some(&redirect()),
            &CommandArgs::keyword([("Channel", "SIP/100-1")]),
        )
        .expect_err("partial keywords");
        assert_eq!(
            err,
            ArgumentError::MissingRequired {
                action: "Redirect".to_string(),
                required: vec!["Exten".to_string(), "Context".to_string(), "Priority".to_string()],
            }
        );
    }

    #[test]
    fn positional_and_keyword_are_exclusive() {
        let args = CommandArgs::positional(["SIP/100-1", "200", "default", "1"]).with("ExtraChannel", "x");
        assert!(matches!(
            build_arguments("Redirect", Some(&redirect()), &args),
            Err(ArgumentError::MixedArguments { .. })
        ));
    }

    #[test]
    fn positional_values_bind_by_position_when_count_matches() {
        let spec = redirect();
        let bound = build_arguments(
            "Redirect",
            Some(&spec),
            &CommandArgs::positional(["SIP/100-1", "200", "default", "1"]),
        )
        .expect("bound");
        assert_eq!(
            bound,
            fields(&[
                ("Channel", "SIP/100-1"),
                ("Exten", "200"),
                ("Context", "default"),
                ("Priority", "1"),
            ])
        );

        assert_eq!(
            build_arguments("Redirect", Some(&spec), &CommandArgs::positional(["SIP/100-1"])),
            Err(ArgumentError::PositionalCount {
                action: "Redirect".to_string(),
                expected: 4,
                found: 1,
            })
        );
    }

    #[test]
    fn empty_values_are_not_forwarded() {
        let spec = ActionCatalog::default()
            .action("Hangup")
            .cloned()
            .expect("hangup spec");
        let bound = build_arguments(
            "Hangup",
            Some(&spec),
            &CommandArgs::keyword([("Channel", "SIP/100-1"), ("Cause", ""), ("Zeta", "1")]),
        )
        .expect("bound");
        assert_eq!(bound, fields(&[("Channel", "SIP/100-1")]));
    }

    #[test]
    fn misspelled_optional_key_never_reaches_the_wire() {
        let catalog = ActionCatalog::default();
        let bound = build_arguments(
            "Hangup",
            catalog.action("Hangup"),
            &CommandArgs::keyword([("Channel", "SIP/100-1"), ("Cuase", "16")]),
        )
        .expect("bound");
        assert_eq!(bound, fields(&[("Channel", "SIP/100-1")]));

        let bound = build_arguments(
            "Hangup",
            catalog.action("Hangup"),
            &CommandArgs::keyword([("Cause", "16"), ("Channel", "SIP/100-1")]),
        )
        .expect("bound");
        assert_eq!(bound, fields(&[("Channel", "SIP/100-1"), ("Cause", "16")]));
    }

    #[test]
    fn uncatalogued_actions_take_keywords_only() {
        assert_eq!(
            build_arguments("QueueStatus", None, &CommandArgs::keyword([("Queue", "support"), ("Member", "")])),
            Ok(fields(&[("Queue", "support")]))
        );
        assert_eq!(
            build_arguments("QueueStatus", None, &CommandArgs::positional(["support"])),
            Err(ArgumentError::UnknownAction("QueueStatus".to_string()))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn argument_errors_surface_before_connection_checks() {
        let controller = Controller::new(ControllerConfig::default());
        let result = controller
            .query("Redirect", CommandArgs::keyword([("Channel", "SIP/100-1")]))
            .await;
        assert!(matches!(
            result,
            Err(AmiError::InvalidArgument(ArgumentError::MissingRequired { .. }))
        ));
        assert!(matches!(
            controller.query("Ping", CommandArgs::default()).await,
            Err(AmiError::NotConnected)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn list_query_returns_items_and_sentinel_in_arrival_order() {
        let ami = FakeAmi::start().await;
        let controller = Controller::new(ami.config());
        controller.login().await.expect("login");

        let outcome = controller
            .query("SIPpeers", CommandArgs::default())
            .await
            .expect("sip peers");
        assert!(outcome.complete);
        assert!(outcome.is_success());
        let order = outcome
            .events
            .iter()
            .map(|event| event.name().or(event.response()).unwrap_or_default())
            .collect::<Vec<_>>();
        assert_eq!(order, vec!["Success", "PeerEntry", "PeerEntry", "PeerlistComplete"]);
        assert_eq!(outcome.items("PeerEntry").count(), 2);
        assert!(outcome
            .events
            .iter()
            .all(|event| event.action_id() == Some(outcome.action_id.as_str())));
        controller.logoff().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_sentinel_returns_partial_after_budget() {
        let ami = FakeAmi::start().await;
        let mut config = ami.config();
        config.wait_budget = Duration::from_millis(300);
        let controller = Controller::new(config);
        controller.login().await.expect("login");

        let outcome = controller
            .query("SIPshowregistry", CommandArgs::default())
            .await
            .expect("registry");
        assert!(!outcome.complete);
        assert!(outcome.response().is_some());
        assert_eq!(outcome.items("RegistryEntry").count(), 1);
        controller.logoff().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn error_response_completes_without_sentinel() {
        let ami = FakeAmi::start().await;
        let controller = Controller::new(ami.config());
        controller.login().await.expect("login");

        let outcome = controller
            .query_raw("NoSuchAction", &[], Some("NeverComes"))
            .await
            .expect("query");
        assert!(outcome.complete);
        assert!(!outcome.is_success());
        controller.logoff().await;
    }
}
