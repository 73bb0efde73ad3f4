/// Test that the macros work when annotated-telemetry is renamed.

#[my_annotated_telemetry::trace]
pub fn trace_basic() {
    unimplemented!("testing compilation")
}

#[my_annotated_telemetry::trace(name = "custom_name", component = "renamed")]
pub fn trace_custom_name() -> Result<u8, String> {
    unimplemented!("testing compilation")
}

pub struct Opaque;

#[my_annotated_telemetry::count]
#[my_annotated_telemetry::trace]
pub fn error_without_debug() -> Result<u8, Opaque> {
    Err(Opaque)
}

#[my_annotated_telemetry::count]
pub fn generic_error<E>(error: E) -> Result<(), E> {
    Err(error)
}

#[my_annotated_telemetry::customize_inner_span(tags = { "key": "value", "number": 42 })]
pub fn customize_tags() {
    unimplemented!("testing compilation")
}

#[my_annotated_telemetry::count]
#[my_annotated_telemetry::time(name = "{type}.{method}.time")]
pub fn count_and_time(input: &str) -> usize {
    input.len()
}

#[my_annotated_telemetry::track_concurrency(tags = { "pool": "io" })]
pub fn concurrency(items: Vec<u32>) -> Option<u32> {
    items.first().copied()
}

#[my_annotated_telemetry::histogram(unit = "ms")]
pub fn histogram_value() -> f64 {
    unimplemented!("testing compilation")
}

#[my_annotated_telemetry::gauge(name = "depth")]
pub fn gauge_value() -> i64 {
    unimplemented!("testing compilation")
}

#[my_annotated_telemetry::count(crate = ::my_annotated_telemetry)]
pub fn explicit_crate_path() -> i32 {
    unimplemented!("testing compilation")
}

pub struct Service;

impl Service {
    #[my_annotated_telemetry::trace]
    pub fn method(&self, id: u64) -> String {
        id.to_string()
    }

    #[my_annotated_telemetry::gauge]
    pub fn consuming(self) -> f32 {
        1.0
    }
}
