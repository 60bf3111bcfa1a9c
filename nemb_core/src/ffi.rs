//! C ABI (spec §6): a thin `#[no_mangle] extern "C"` wrapper around one process-wide
//! `Meter`, matching "exactly one `Meter` instance per process" implied by
//! `nemb_initialize()` taking no arguments. Built only when the `cdylib`/`staticlib`
//! targets are produced; the ordinary Rust API in `crate::facade` needs none of this.

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::sync::{Mutex, OnceLock};

use serde::Serialize;

use crate::config::MeterConfig;
use crate::facade::{new_meter, Meter};

static METER: OnceLock<Mutex<Meter>> = OnceLock::new();

fn with_meter<T>(default: T, f: impl FnOnce(&mut Meter) -> T) -> T {
    match METER.get() {
        Some(mutex) => {
            let mut guard = mutex.lock().expect("meter mutex poisoned");
            f(&mut guard)
        }
        None => default,
    }
}

/// Initializes the process-wide `Meter` with the `balanced` preset. Returns 1 on success,
/// 0 on failure (including "already initialized").
#[no_mangle]
pub extern "C" fn nemb_initialize() -> c_int {
    if METER.get().is_some() {
        return 0;
    }
    match new_meter(MeterConfig::balanced()) {
        Ok(meter) => {
            let _ = METER.set(Mutex::new(meter));
            1
        }
        Err(e) => {
            log::warn!("nemb_initialize failed: {e}");
            0
        }
    }
}

/// Returns a session id, or 0 if the meter is not initialized.
///
/// # Safety
/// `label` must be a valid, NUL-terminated C string for the duration of this call.
#[no_mangle]
pub unsafe extern "C" fn nemb_start_session(label: *const c_char) -> u64 {
    let label = if label.is_null() {
        "".to_string()
    } else {
        unsafe { CStr::from_ptr(label) }.to_string_lossy().into_owned()
    };
    with_meter(0, |meter| meter.start_session(label))
}

/// # Safety
/// `energy_j_out` and `avg_power_w_out` must be valid, writable `f64` pointers, or null.
#[no_mangle]
pub unsafe extern "C" fn nemb_stop_session(id: u64, energy_j_out: *mut f64, avg_power_w_out: *mut f64) -> c_int {
    with_meter(0, |meter| {
        let diff = meter.end_session(id);
        if !diff.valid {
            return 0;
        }
        unsafe {
            if !energy_j_out.is_null() {
                *energy_j_out = diff.energy_joules;
            }
            if !avg_power_w_out.is_null() {
                *avg_power_w_out = diff.average_power_watts;
            }
        }
        1
    })
}

/// # Safety
/// `energy_j_out` and `power_w_out` must be valid, writable `f64` pointers, or null.
#[no_mangle]
pub unsafe extern "C" fn nemb_read_current(energy_j_out: *mut f64, power_w_out: *mut f64) -> c_int {
    with_meter(0, |meter| {
        let reading = meter.read_instant();
        if reading.is_failure() {
            return 0;
        }
        unsafe {
            if !energy_j_out.is_null() {
                *energy_j_out = reading.aggregate_energy_joules;
            }
            if !power_w_out.is_null() {
                *power_w_out = reading.aggregate_power_watts;
            }
        }
        1
    })
}

/// # Safety
/// `name` must be a valid, NUL-terminated C string for the duration of this call.
#[no_mangle]
pub unsafe extern "C" fn nemb_mark_checkpoint(name: *const c_char) {
    if name.is_null() {
        return;
    }
    let name = unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned();
    with_meter((), |meter| meter.mark_checkpoint(name));
}

#[derive(Serialize)]
struct CheckpointWire {
    checkpoint_id: String,
    timestamp: u64,
    joules: f64,
    watts: f64,
}

#[derive(Serialize)]
struct CheckpointsWire {
    checkpoints: Vec<CheckpointWire>,
}

/// Encodes all correlated checkpoints as JSON into `buf`. Returns 1 on success, 0 on
/// failure, and the negated required buffer size (including the NUL terminator) when `buf`
/// is too small, per spec §6's return convention.
///
/// # Safety
/// `buf` must point to a writable buffer of at least `buf_len` bytes, or `buf_len` must be 0.
#[no_mangle]
pub unsafe extern "C" fn nemb_get_checkpoints_json(buf: *mut c_char, buf_len: c_int) -> c_int {
    let wire = with_meter(None, |meter| {
        let checkpoints = meter
            .correlated_checkpoints()
            .into_iter()
            .map(|c| CheckpointWire {
                checkpoint_id: c.name,
                timestamp: c.timestamp_ns,
                joules: c.cumulative_energy_joules,
                watts: c.instantaneous_power_watts,
            })
            .collect();
        Some(CheckpointsWire { checkpoints })
    });
    let Some(wire) = wire else { return 0 };
    let json = match serde_json::to_string(&wire) {
        Ok(s) => s,
        Err(_) => return 0,
    };
    let Ok(cstring) = CString::new(json) else { return 0 };
    let bytes = cstring.as_bytes_with_nul();

    if buf.is_null() || buf_len < 0 || bytes.len() > buf_len as usize {
        return -(bytes.len() as c_int);
    }
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr() as *const c_char, buf, bytes.len());
    }
    1
}
