pub mod fleet_events;
pub mod guild_parameters;
pub mod instance_activity;
pub mod instances;
pub mod owner_bans;
pub mod owners;
