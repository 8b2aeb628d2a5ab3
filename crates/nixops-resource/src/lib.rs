pub mod store;
pub mod types;

pub use store::{ResourceStore, StoreError};
pub use types::{
    upsert_condition, AdditionalFile, Condition, Machine, MachineSpec, MachineStatus,
    NixosConfiguration, NixosConfigurationSpec, NixosConfigurationStatus, Phase, FINALIZER,
};
