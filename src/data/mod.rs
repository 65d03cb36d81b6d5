//! Data structures for biomarker harmonization and analysis.

mod manifest;
mod participants;
mod records;

pub use manifest::{
    is_blood_candidate, parse_cycle_years, split_label_unit, CycleInfo, RawVariable,
    ValueProfile, VariableManifest,
};
pub use participants::{
    default_flag_rules, FlagAvailability, FlagRule, HealthyCriteria, Participant,
    ParticipantTable, Sex,
};
pub use records::{BiomarkerRecord, LongDataset};
