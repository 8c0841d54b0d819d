use std::collections::HashMap;
use std::sync::Arc;

use super::flow::{erase, restore, ErasedFlow, Flow};
use crate::domain::identity::Party;
use crate::domain::session::SessionId;
use crate::CoreError;

/// Factory rebuilding a flow from its checkpointed value
pub type RestoreFactory =
    Arc<dyn Fn(serde_json::Value) -> Result<Box<dyn ErasedFlow>, CoreError> + Send + Sync>;

/// Factory creating a responder for an inbound session
pub type ResponderFactory = Arc<dyn Fn(Party, SessionId) -> Box<dyn ErasedFlow> + Send + Sync>;

/// Flows known to a node.
///
/// Every flow that can be checkpointed must be registered so that it can be
/// restored by name. Responders are keyed by the name of the flow that
/// initiates them.
#[derive(Clone, Default)]
pub struct FlowRegistry {
    flows: HashMap<&'static str, RestoreFactory>,
    responders: HashMap<&'static str, ResponderFactory>,
}

impl FlowRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a flow that this node may start or restore
    pub fn register<F: Flow>(&mut self) -> &mut Self {
        self.flows.insert(F::NAME, Arc::new(restore::<F>));
        self
    }

    /// Register the responder started when a counterparty runs `I`
    pub fn register_responder<I, R, Fac>(&mut self, factory: Fac) -> &mut Self
    where
        I: Flow,
        R: Flow,
        Fac: Fn(Party, SessionId) -> R + Send + Sync + 'static,
    {
        self.register::<R>();
        self.responders.insert(
            I::NAME,
            Arc::new(move |party, session| erase(factory(party, session))),
        );
        self
    }

    /// Whether a flow is registered under `name`
    pub fn is_registered(&self, name: &str) -> bool {
        self.flows.contains_key(name)
    }

    /// Rebuild a checkpointed flow
    pub fn restore(
        &self,
        name: &str,
        continuation: serde_json::Value,
    ) -> Result<Box<dyn ErasedFlow>, CoreError> {
        let factory = self
            .flows
            .get(name)
            .ok_or_else(|| CoreError::FlowNotRegistered(name.to_string()))?;
        factory(continuation)
    }

    /// Create the responder for a session opened by `initiating_flow`
    pub fn responder(
        &self,
        initiating_flow: &str,
        party: Party,
        session: SessionId,
    ) -> Option<Box<dyn ErasedFlow>> {
        self.responders
            .get(initiating_flow)
            .map(|factory| factory(party, session))
    }
}

impl std::fmt::Debug for FlowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut flows: Vec<&&str> = self.flows.keys().collect();
        flows.sort();
        let mut responders: Vec<&&str> = self.responders.keys().collect();
        responders.sort();
        f.debug_struct("FlowRegistry")
            .field("flows", &flows)
            .field("responders", &responders)
            .finish()
    }
}
