//! Rhai API exposed to processing scripts.
//!
//! Scripts see two host types ([`ControlMap`] and [`AudioChannel`]) and a
//! handful of helpers for declaring MIDI outputs. Both host types share
//! their storage between clones, so a callback writing into an argument is
//! visible to the host after the call returns.

pub mod audio;
pub mod midi;

pub use audio::AudioChannel;
pub use midi::ControlMap;

use rhai::Engine;

/// Register every scriptbox type and helper with a Rhai engine.
pub fn register_api(engine: &mut Engine) {
    midi::register(engine);
    audio::register(engine);
}

/// Create a Rhai engine with the scriptbox API registered.
pub fn create_engine() -> Engine {
    let mut engine = Engine::new();

    engine.set_max_expr_depths(1024, 1024);
    engine.set_max_call_levels(512);

    // Scripts have no stdout of their own when hosted in a plugin
    engine.on_print(|text| {
        log::info!("[script] {}", text);
    });

    engine.on_debug(|text, source, pos| {
        let loc = match (source, pos) {
            (Some(src), pos) if !pos.is_none() => format!(" ({}:{})", src, pos),
            (Some(src), _) => format!(" ({})", src),
            (None, pos) if !pos.is_none() => format!(" ({})", pos),
            _ => String::new(),
        };
        log::debug!("[script]{} {}", loc, text);
    });

    register_api(&mut engine);

    engine
}
