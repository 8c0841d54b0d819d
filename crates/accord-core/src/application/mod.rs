/// Flow logic, events and the step context
pub mod flow;

/// Registry of restorable flows and responders
pub mod registry;

/// Node services exposed to flows
pub mod service_hub;

/// Flow scheduling, session routing and checkpoint recovery
pub mod state_machine_manager;
