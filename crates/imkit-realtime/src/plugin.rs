//! Plugins: bundles of optional hooks and message classes.
//!
//! Hooks from every registered plugin are merged into one [`PluginHooks`]
//! per `Realtime`, in registration order. Registration is append-only.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use imkit_core::pipeline::{Decorator, Middleware, Predicate};
use imkit_core::{Decorators, Flow, Gate, Pipeline};
use imkit_message::{Message, MessageClass};

use crate::client::IMClient;
use crate::conversation::Conversation;
use crate::realtime::Realtime;

/// What a `before_message_dispatch` hook sees.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub message: Message,
    pub conversation: Conversation,
}

/// A named set of hooks.
///
/// ```ignore
/// let plugin = Plugin::new()
///     .name("drop-spam")
///     .before_message_dispatch(|ctx| !ctx.message.mentioned_all());
/// ```
#[derive(Clone, Default)]
pub struct Plugin {
    name: Option<String>,
    before_message_parse: Option<Middleware<Value>>,
    after_message_parse: Option<Middleware<Message>>,
    before_message_dispatch: Option<Predicate<DispatchContext>>,
    message_classes: Vec<MessageClass>,
    on_conversation_create: Option<Decorator<Conversation>>,
    on_imclient_create: Option<Decorator<IMClient>>,
    on_realtime_create: Option<Decorator<Realtime>>,
}

impl Plugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn plugin_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Transform or reject the raw envelope before it is classified.
    pub fn before_message_parse<F>(mut self, hook: F) -> Self
    where
        F: Fn(Value) -> Flow<Value> + Send + Sync + 'static,
    {
        self.before_message_parse = Some(Arc::new(hook));
        self
    }

    /// Transform or reject the constructed message.
    pub fn after_message_parse<F>(mut self, hook: F) -> Self
    where
        F: Fn(Message) -> Flow<Message> + Send + Sync + 'static,
    {
        self.after_message_parse = Some(Arc::new(hook));
        self
    }

    /// Returning false drops the message before any "message" event fires.
    pub fn before_message_dispatch<F>(mut self, hook: F) -> Self
    where
        F: Fn(&DispatchContext) -> bool + Send + Sync + 'static,
    {
        self.before_message_dispatch = Some(Arc::new(hook));
        self
    }

    pub fn message_classes<I>(mut self, classes: I) -> Self
    where
        I: IntoIterator<Item = MessageClass>,
    {
        self.message_classes.extend(classes);
        self
    }

    pub fn on_conversation_create<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Conversation) + Send + Sync + 'static,
    {
        self.on_conversation_create = Some(Arc::new(hook));
        self
    }

    pub fn on_imclient_create<F>(mut self, hook: F) -> Self
    where
        F: Fn(&IMClient) + Send + Sync + 'static,
    {
        self.on_imclient_create = Some(Arc::new(hook));
        self
    }

    pub fn on_realtime_create<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Realtime) + Send + Sync + 'static,
    {
        self.on_realtime_create = Some(Arc::new(hook));
        self
    }

    pub(crate) fn classes(&self) -> &[MessageClass] {
        &self.message_classes
    }
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.name)
            .field("message_classes", &self.message_classes.len())
            .finish()
    }
}

/// The merged hooks of every registered plugin.
#[derive(Clone, Default)]
pub(crate) struct PluginHooks {
    pub before_message_parse: Pipeline<Value>,
    pub after_message_parse: Pipeline<Message>,
    pub before_message_dispatch: Gate<DispatchContext>,
    pub on_conversation_create: Decorators<Conversation>,
    pub on_imclient_create: Decorators<IMClient>,
    pub on_realtime_create: Decorators<Realtime>,
}

impl PluginHooks {
    pub fn extend(&mut self, plugin: &Plugin) {
        let name = plugin.name.as_deref();
        if let Some(hook) = &plugin.before_message_parse {
            self.before_message_parse.push(name, Arc::clone(hook));
        }
        if let Some(hook) = &plugin.after_message_parse {
            self.after_message_parse.push(name, Arc::clone(hook));
        }
        if let Some(hook) = &plugin.before_message_dispatch {
            self.before_message_dispatch.push(name, Arc::clone(hook));
        }
        if let Some(hook) = &plugin.on_conversation_create {
            self.on_conversation_create.push(name, Arc::clone(hook));
        }
        if let Some(hook) = &plugin.on_imclient_create {
            self.on_imclient_create.push(name, Arc::clone(hook));
        }
        if let Some(hook) = &plugin.on_realtime_create {
            self.on_realtime_create.push(name, Arc::clone(hook));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imkit_message::{MessageParser, MessageRegistry};
    use serde_json::json;

    #[test]
    fn test_hooks_merge_in_registration_order() {
        let first = Plugin::new().name("first").before_message_parse(|mut raw: Value| {
            raw["data"] = json!(format!("{}1", raw["data"].as_str().unwrap_or_default()));
            Flow::Continue(raw)
        });
        let second = Plugin::new().name("second").before_message_parse(|mut raw: Value| {
            raw["data"] = json!(format!("{}2", raw["data"].as_str().unwrap_or_default()));
            Flow::Continue(raw)
        });

        let mut hooks = PluginHooks::default();
        hooks.extend(&first);
        hooks.extend(&second);

        let registry = MessageRegistry::new();
        let parser = MessageParser::new(&registry)
            .with_hooks(&hooks.before_message_parse, &hooks.after_message_parse);
        let message = parser
            .parse(json!({"data": "x"}))
            .unwrap()
            .into_option()
            .unwrap();
        assert_eq!(message.payload().to_json_value(), json!("x12"));
    }

    #[test]
    fn test_rejection_names_the_plugin() {
        let plugin = Plugin::new()
            .name("censor")
            .after_message_parse(|_: Message| Flow::reject("blocked"));
        let mut hooks = PluginHooks::default();
        hooks.extend(&plugin);

        match hooks.after_message_parse.run(Message::text("hi")) {
            Flow::Reject(rejection) => assert_eq!(rejection.stage.as_deref(), Some("censor")),
            Flow::Continue(_) => panic!("expected rejection"),
        }
    }

    #[test]
    fn test_plugin_without_hooks_adds_nothing() {
        let plugin = Plugin::new().message_classes([MessageClass::typed(3, "Image")]);
        let mut hooks = PluginHooks::default();
        hooks.extend(&plugin);
        assert!(hooks.before_message_parse.is_empty());
        assert!(hooks.after_message_parse.is_empty());
        assert_eq!(plugin.classes().len(), 1);
    }
}
