/// Hashes, keys, parties and signatures
pub mod identity;

/// Ledger states and transactions
pub mod transaction;

/// Contract code and ledger verification
pub mod contract;

/// Upgrade verification clause
pub mod clauses;

/// Flow instance domain models
pub mod flow_instance;

/// Sessions between flows
pub mod session;

/// Session protocol messages and transport
pub mod messaging;

/// I/O requests of suspended flows
pub mod io_request;

/// Checkpoint format
pub mod checkpoint;

/// Domain events
pub mod events;

/// Repository interfaces
pub mod repository;
