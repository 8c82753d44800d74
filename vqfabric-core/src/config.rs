//! Configuration builders (SPEC_FULL.md section 1), mirroring the teacher's
//! `DeviceConfigurator` pattern: a `derive_builder`-generated builder per
//! config struct, with a manual `validate` hook for cross-field invariants.

#[derive(Builder, Debug, Clone)]
#[builder(name = "DeviceInstanceConfigBuilder", build_fn(validate = "Self::validate"))]
pub struct DeviceInstanceConfig {
    /// Bus-function-slot string returned by `GET_PCIBUS_DEVICE_NAME`.
    pub bus_name: String,

    /// DIR discovery poll timeout (spec.md section 4.3 step 1).
    #[builder(default = "30")]
    pub discovery_timeout_secs: u64,

    /// Expected DIR header version; mismatch is a warning, not fatal.
    #[builder(default = "1")]
    pub expected_dir_version: u32,
}

impl DeviceInstanceConfig {
    fn validate(builder: &DeviceInstanceConfigBuilder) -> std::result::Result<(), String> {
        if matches!(&builder.bus_name, Some(name) if name.is_empty()) {
            return Err("bus_name must not be empty".into());
        }
        Ok(())
    }
}

/// spec.md section 3 "Reset Config": estimated down-time is read-only from
/// the caller's perspective once set at probe; discovery timeout is
/// user-tunable via the `soc_reset` sysfs group (out of scope here).
#[derive(Builder, Debug, Clone, Copy)]
#[builder(name = "ResetConfigBuilder")]
pub struct ResetConfig {
    pub max_estimated_downtime_ms: u64,

    #[builder(default = "30_000")]
    pub discovery_timeout_ms: u64,
}
