// src/lib.rs
// Point d'entrée de la bibliothèque du noyau : ordonnanceur à parts garanties
#![cfg_attr(not(test), no_std)]

// Import de alloc pour les tables de processus et les files prêtes
extern crate alloc;

pub mod logger;
pub mod scheduler;

pub use scheduler::{
    BlockReason, Dispatcher, PrivId, ResponseOutcome, RuntimeFlags, SchedError, SchedResult, SharedDispatcher,
    SpawnParams, Transition,
};

/// Version du noyau
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialise le journal puis l'ordonnanceur global
pub fn init(config: gsched_abi::SchedConfig, level: log::LevelFilter) -> SchedResult<&'static SharedDispatcher> {
    // un journal déjà installé n'empêche pas de démarrer
    let _ = logger::init(level);
    log::info!("gsched kernel v{}", VERSION);
    scheduler::init(config)
}
