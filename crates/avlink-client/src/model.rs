//! Device model definitions.
//!
//! A device model describes one family of A/V equipment: how its link is
//! configured ([`ProtocolConfig`], optional default [`SerialConfig`]) and the
//! actions it supports. Models arrive as data, typically YAML or JSON, and
//! deserialize into a [`ModelDefinition`]:
//!
//! ```yaml
//! id: mcintosh_mx160
//! protocol:
//!   command_eol: "\r"
//!   response_eol: "\r"
//! rs232:
//!   baudrate: 115200
//! api:
//!   volume:
//!     actions:
//!       set:
//!         cmd:
//!           fstring: "VOL{zone}={level}"
//!         msg:
//!           regex: "VOL(?P<zone>\\d)=(?P<level>\\d+)\r"
//! ```
//!
//! [`DeviceModel::from_definition`] validates a definition once and builds
//! the lookup table used by the client: each action's id is
//! `"<group>.<name>"`, its template is parsed, and its response pattern is
//! compiled. Definition order is kept; it is the order in which response
//! patterns are tried.
//!
//! Loaded models are immutable and shared behind an `Arc` by every client
//! for that model. [`ModelRegistry`] is a plain, caller-owned lookup of
//! models by id.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};

use avlink_core::error::{Error, Result};
use avlink_core::types::WireEncoding;
use avlink_link::frame::{Template, DEFAULT_EOL};
use avlink_link::matcher::ResponseMatcher;
use avlink_link::session::LinkConfig;
use avlink_transport::SerialConfig;

// ---------------------------------------------------------------------------
// Serde shape
// ---------------------------------------------------------------------------

/// Link-level settings of a device model.
///
/// All fields are optional in the source data. Durations are given in
/// seconds and may be fractional.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Appended to every encoded action.
    pub command_eol: String,
    /// Terminates every reply line.
    pub response_eol: String,
    pub encoding: WireEncoding,
    /// Minimum time between the starts of two writes.
    #[serde(deserialize_with = "seconds", alias = "min_command_interval")]
    pub min_time_between_commands: Duration,
    /// Response timeout for a single command.
    #[serde(deserialize_with = "seconds", alias = "response_timeout")]
    pub timeout: Duration,
    /// Leading reply bytes ignored before framing, such as a command echo.
    pub skip_bytes: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            command_eol: String::new(),
            response_eol: String::from_utf8_lossy(DEFAULT_EOL).into_owned(),
            encoding: WireEncoding::Ascii,
            min_time_between_commands: Duration::ZERO,
            timeout: Duration::from_secs(1),
            skip_bytes: 0,
        }
    }
}

/// A device model as it appears in source data.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelDefinition {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    /// Factory serial settings; callers may override them per connection.
    #[serde(default)]
    pub rs232: Option<SerialConfig>,
    /// Action groups, in definition order.
    #[serde(default, deserialize_with = "ordered_map")]
    pub api: Vec<(String, GroupDefinition)>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroupDefinition {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "ordered_map")]
    pub actions: Vec<(String, ActionSpec)>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActionSpec {
    #[serde(default)]
    pub description: Option<String>,
    pub cmd: CommandSpec,
    #[serde(default)]
    pub msg: Option<MessageSpec>,
    /// Wait for a reply line even without a `msg` pattern.
    #[serde(default)]
    pub wait_for_reply: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandSpec {
    pub fstring: String,
    /// Parameter name to description.
    #[serde(default)]
    pub docs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageSpec {
    pub regex: String,
    /// Response field name to description.
    #[serde(default)]
    pub docs: BTreeMap<String, String>,
}

fn seconds<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs)
        .map_err(|_| de::Error::custom(format!("invalid duration: {secs} seconds")))
}

/// Deserialize a map into key/value pairs, keeping source order.
fn ordered_map<'de, D, T>(deserializer: D) -> std::result::Result<Vec<(String, T)>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    struct OrderedVisitor<T>(PhantomData<T>);

    impl<'de, T: Deserialize<'de>> Visitor<'de> for OrderedVisitor<T> {
        type Value = Vec<(String, T)>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a map")
        }

        fn visit_unit<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
            Ok(Vec::new())
        }

        fn visit_map<A>(self, mut map: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut entries: Vec<(String, T)> = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some((key, value)) = map.next_entry::<String, T>()? {
                if entries.iter().any(|(k, _)| *k == key) {
                    return Err(de::Error::custom(format!("duplicate key {key:?}")));
                }
                entries.push((key, value));
            }
            Ok(entries)
        }
    }

    deserializer.deserialize_map(OrderedVisitor(PhantomData))
}

// ---------------------------------------------------------------------------
// Validated model
// ---------------------------------------------------------------------------

/// One action of a loaded model.
#[derive(Debug, Clone)]
pub struct ActionDefinition {
    /// `"<group>.<name>"`.
    pub id: String,
    pub group: String,
    pub name: String,
    pub description: Option<String>,
    pub template: Template,
    /// Structured reply format; named groups become response fields.
    pub response_pattern: Option<Regex>,
    pub wait_for_reply: bool,
    pub param_docs: BTreeMap<String, String>,
    pub field_docs: BTreeMap<String, String>,
}

impl ActionDefinition {
    /// Placeholder names of the command template, in first-use order.
    pub fn required_params(&self) -> &[String] {
        self.template.params()
    }

    /// Whether sending this action waits for a reply line.
    pub fn expects_response(&self) -> bool {
        self.response_pattern.is_some() || self.wait_for_reply
    }

    fn doc(&self) -> ActionDoc {
        let params = self
            .required_params()
            .iter()
            .map(|name| FieldDoc {
                name: name.clone(),
                doc: self.param_docs.get(name).cloned(),
            })
            .collect();
        let fields = self
            .response_pattern
            .iter()
            .flat_map(|re| re.capture_names().flatten())
            .map(|name| FieldDoc {
                name: name.to_string(),
                doc: self.field_docs.get(name).cloned(),
            })
            .collect();
        ActionDoc {
            id: self.id.clone(),
            description: self.description.clone(),
            command: self.template.source().to_string(),
            params,
            fields,
            wait_for_reply: self.expects_response(),
        }
    }
}

/// Documentation for one action, as returned by [`DeviceModel::describe`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionDoc {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub command: String,
    pub params: Vec<FieldDoc>,
    pub fields: Vec<FieldDoc>,
    pub wait_for_reply: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldDoc {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
}

/// A validated, immutable device model.
#[derive(Debug)]
pub struct DeviceModel {
    id: String,
    name: Option<String>,
    manufacturer: Option<String>,
    protocol: ProtocolConfig,
    serial: SerialConfig,
    actions: Vec<ActionDefinition>,
    index: HashMap<String, usize>,
    matcher: Arc<ResponseMatcher>,
}

impl DeviceModel {
    /// Validate a definition and build the action table.
    ///
    /// Fails with [`Error::InvalidDefinition`] naming the model and action
    /// when a template does not parse, a pattern does not compile, or two
    /// actions share an id.
    pub fn from_definition(definition: ModelDefinition) -> Result<Self> {
        let ModelDefinition {
            id: model_id,
            name,
            manufacturer,
            protocol,
            rs232,
            api,
        } = definition;

        if model_id.trim().is_empty() {
            return Err(Error::InvalidDefinition("model id is empty".into()));
        }
        // Probe the wire encoding so a bad EOL fails at load time.
        protocol.encoding.encode(&protocol.command_eol).map_err(|e| {
            Error::InvalidDefinition(format!("{model_id}: command_eol: {e}"))
        })?;
        if protocol.response_eol.is_empty() {
            return Err(Error::InvalidDefinition(format!(
                "{model_id}: response_eol is empty"
            )));
        }

        let mut actions = Vec::new();
        let mut index = HashMap::new();
        let mut matcher = ResponseMatcher::new();

        for (group, group_def) in api {
            for (action_name, spec) in group_def.actions {
                let id = format!("{group}.{action_name}");
                let invalid = |why: String| {
                    Error::InvalidDefinition(format!("{model_id}: action {id}: {why}"))
                };

                if group.is_empty() || action_name.is_empty() {
                    return Err(invalid("empty group or action name".into()));
                }
                if index.contains_key(&id) {
                    return Err(invalid("duplicate action id".into()));
                }

                let template = Template::parse(&spec.cmd.fstring).map_err(|e| match e {
                    Error::InvalidDefinition(why) => invalid(why),
                    other => invalid(other.to_string()),
                })?;

                let (response_pattern, field_docs) = match spec.msg {
                    Some(msg) => {
                        let re = Regex::new(&msg.regex)
                            .map_err(|e| invalid(format!("bad response pattern: {e}")))?;
                        matcher.add(id.clone(), re.clone());
                        (Some(re), msg.docs)
                    }
                    None => (None, BTreeMap::new()),
                };

                index.insert(id.clone(), actions.len());
                actions.push(ActionDefinition {
                    id,
                    group: group.clone(),
                    name: action_name,
                    description: spec.description,
                    template,
                    response_pattern,
                    wait_for_reply: spec.wait_for_reply,
                    param_docs: spec.cmd.docs,
                    field_docs,
                });
            }
        }

        tracing::debug!(
            model = %model_id,
            actions = actions.len(),
            patterns = matcher.len(),
            "loaded device model"
        );

        Ok(DeviceModel {
            id: model_id,
            name,
            manufacturer,
            protocol,
            serial: rs232.unwrap_or_default(),
            actions,
            index,
            matcher: Arc::new(matcher),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn manufacturer(&self) -> Option<&str> {
        self.manufacturer.as_deref()
    }

    pub fn protocol(&self) -> &ProtocolConfig {
        &self.protocol
    }

    /// Factory serial settings (9600 8N1 when the model names none).
    pub fn serial_config(&self) -> &SerialConfig {
        &self.serial
    }

    /// Look up an action by id.
    pub fn action(&self, id: &str) -> Option<&ActionDefinition> {
        self.index.get(id).map(|&i| &self.actions[i])
    }

    /// All actions in definition order.
    pub fn actions(&self) -> impl Iterator<Item = &ActionDefinition> {
        self.actions.iter()
    }

    /// Every response pattern of the model, in definition order.
    pub fn matcher(&self) -> Arc<ResponseMatcher> {
        Arc::clone(&self.matcher)
    }

    /// Session settings derived from the protocol block.
    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            response_eol: self.protocol.response_eol.as_bytes().to_vec(),
            encoding: self.protocol.encoding,
            min_command_interval: self.protocol.min_time_between_commands,
            matcher: Some(self.matcher()),
            ..LinkConfig::default()
        }
    }

    /// Per-action documentation: parameters, response fields, and their docs.
    pub fn describe(&self) -> Vec<ActionDoc> {
        self.actions.iter().map(ActionDefinition::doc).collect()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Loaded models by id.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, Arc<DeviceModel>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a loaded model. Ids must be unique.
    pub fn register(&mut self, model: DeviceModel) -> Result<Arc<DeviceModel>> {
        if self.models.contains_key(model.id()) {
            return Err(Error::InvalidDefinition(format!(
                "model {} is already registered",
                model.id()
            )));
        }
        let model = Arc::new(model);
        self.models.insert(model.id().to_string(), Arc::clone(&model));
        Ok(model)
    }

    /// Validate a definition and register the result.
    pub fn load(&mut self, definition: ModelDefinition) -> Result<Arc<DeviceModel>> {
        self.register(DeviceModel::from_definition(definition)?)
    }

    pub fn get(&self, id: &str) -> Option<Arc<DeviceModel>> {
        self.models.get(id).cloned()
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
