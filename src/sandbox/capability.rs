//! Capability surface: the only functions a strategy can import.
//!
//! All imports live in the `host` module. The linker defines nothing else, so
//! a strategy importing anything outside this list fails to instantiate.

use anyhow::{anyhow, Result};
use serde_json::{Map, Value};
use wasmtime::{Caller, Extern, Linker, Memory};

use crate::protocol::as_number;

use super::outbox::Outbox;

/// Import module name for every capability.
pub const HOST_MODULE: &str = "host";

/// Per-session store data. One instance per session, never shared.
pub struct CapabilitySurface {
    outbox: Outbox,
    config: Map<String, Value>,
    config_json: Vec<u8>,
    meta_json: Vec<u8>,
    current_tick: u64,
}

impl CapabilitySurface {
    pub fn new(outbox: Outbox, config: Map<String, Value>, meta: &Value) -> Self {
        // Serializing a Value cannot fail; fall back to empty bindings regardless.
        let config_json = serde_json::to_vec(&config).unwrap_or_else(|_| b"{}".to_vec());
        let meta_json = serde_json::to_vec(meta).unwrap_or_else(|_| b"null".to_vec());

        Self {
            outbox,
            config,
            config_json,
            meta_json,
            current_tick: 0,
        }
    }

    pub fn outbox_mut(&mut self) -> &mut Outbox {
        &mut self.outbox
    }

    /// Tick number attached to effects emitted from now on (0 = evaluation).
    pub fn set_current_tick(&mut self, tick: u64) {
        self.current_tick = tick;
    }

    fn log(&mut self, line: String) {
        let tick = self.current_tick;
        self.outbox.log(line, tick);
    }

    fn metric(&mut self, value: f64) {
        let tick = self.current_tick;
        self.outbox.metric(value, tick);
    }

    fn place_order(&mut self, order: Value) {
        let tick = self.current_tick;
        self.outbox.order(order, tick);
    }

    fn config_number(&self, key: &str) -> f64 {
        self.config
            .get(key)
            .and_then(as_number)
            .unwrap_or(f64::NAN)
    }
}

/// Register the capability imports on a linker.
pub fn link(linker: &mut Linker<CapabilitySurface>) -> Result<()> {
    linker.func_wrap(
        HOST_MODULE,
        "log",
        |mut caller: Caller<'_, CapabilitySurface>, ptr: i32, len: i32| {
            let line = match read_guest(&mut caller, ptr, len) {
                Ok(bytes) => render_log(&bytes),
                Err(reason) => format!("<unreadable log payload: {reason}>"),
            };
            caller.data_mut().log(line);
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "metric",
        |mut caller: Caller<'_, CapabilitySurface>, value: f64| {
            caller.data_mut().metric(value);
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "place_order",
        |mut caller: Caller<'_, CapabilitySurface>, ptr: i32, len: i32| -> Result<()> {
            let bytes = read_guest(&mut caller, ptr, len)
                .map_err(|reason| anyhow!("placeOrder payload unreadable: {reason}"))?;
            caller.data_mut().place_order(decode_order(&bytes));
            Ok(())
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "config",
        |mut caller: Caller<'_, CapabilitySurface>, ptr: i32, cap: i32| -> i32 {
            let json = caller.data().config_json.clone();
            write_guest(&mut caller, ptr, cap, &json)
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "meta",
        |mut caller: Caller<'_, CapabilitySurface>, ptr: i32, cap: i32| -> i32 {
            let json = caller.data().meta_json.clone();
            write_guest(&mut caller, ptr, cap, &json)
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "config_number",
        |mut caller: Caller<'_, CapabilitySurface>, ptr: i32, len: i32| -> f64 {
            match read_guest(&mut caller, ptr, len) {
                Ok(key) => caller
                    .data()
                    .config_number(&String::from_utf8_lossy(&key)),
                Err(_) => f64::NAN,
            }
        },
    )?;

    Ok(())
}

/// Render a log payload for display.
///
/// A JSON array prints as its elements separated by spaces (strings verbatim,
/// anything else as compact JSON). Any other JSON value prints as a single
/// element. Non-JSON bytes print as (lossy) text.
pub fn render_log(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Array(values)) => values
            .iter()
            .map(display_value)
            .collect::<Vec<_>>()
            .join(" "),
        Ok(value) => display_value(&value),
        Err(_) => text.into_owned(),
    }
}

/// Order intents are opaque: JSON when it parses, a string otherwise.
pub fn decode_order(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn guest_memory(caller: &mut Caller<'_, CapabilitySurface>) -> Result<Memory, &'static str> {
    match caller.get_export("memory") {
        Some(Extern::Memory(memory)) => Ok(memory),
        _ => Err("module exports no memory"),
    }
}

fn read_guest(
    caller: &mut Caller<'_, CapabilitySurface>,
    ptr: i32,
    len: i32,
) -> Result<Vec<u8>, &'static str> {
    if len < 0 {
        return Err("negative length");
    }
    let memory = guest_memory(caller)?;
    let start = ptr as u32 as usize;
    let end = start.checked_add(len as usize).ok_or("out of bounds")?;

    memory
        .data(&*caller)
        .get(start..end)
        .map(<[u8]>::to_vec)
        .ok_or("out of bounds")
}

// Returns the full length of `bytes`; writes only when it fits in `cap`.
// -1 without an exported memory, whatever the buffer size.
fn write_guest(
    caller: &mut Caller<'_, CapabilitySurface>,
    ptr: i32,
    cap: i32,
    bytes: &[u8],
) -> i32 {
    let Ok(memory) = guest_memory(caller) else {
        return -1;
    };
    let Ok(len) = i32::try_from(bytes.len()) else {
        return -1;
    };
    if cap < 0 {
        return -1;
    }
    if len > cap {
        return len;
    }

    match memory.write(&mut *caller, ptr as u32 as usize, bytes) {
        Ok(()) => len,
        Err(_) => -1,
    }
}
