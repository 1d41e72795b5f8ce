//! Sensor descriptors for `GenericPerf` (§4.5): a raw `(type, config, config1,
//! config2)` tuple, one of a closed set of symbolic hardware/cache/software
//! names, or a `/sys/bus/event_source/devices/*/events/` path whose format
//! file is parsed to build the config bits.

use std::fs;
use std::path::Path;

use crate::error::{errors, AutopinError};
use crate::perf::ffi::{PERF_TYPE_HARDWARE, PERF_TYPE_HW_CACHE, PERF_TYPE_RAW, PERF_TYPE_SOFTWARE};

/// A resolved `(attr_type, config, config1, config2)` ready for `PerfEventAttr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedSensor {
    pub attr_type: u32,
    pub config: u64,
    pub config1: u64,
    pub config2: u64,
}

const HW_CACHE_READ: u64 = 0;
const HW_CACHE_WRITE: u64 = 1;
const HW_CACHE_RESULT_ACCESS: u64 = 0;
const HW_CACHE_RESULT_MISS: u64 = 1;

const CACHE_L1D: u64 = 0;
const CACHE_L1I: u64 = 1;
const CACHE_LL: u64 = 2;
const CACHE_DTLB: u64 = 3;

fn cache_config(cache: u64, op: u64, result: u64) -> u64 {
    cache | (op << 8) | (result << 16)
}

/// The closed set of symbolic event names §4.5 allows, mirroring the names
/// `perf-stat(1)` itself accepts for the hardware/software/cache classes.
fn symbolic_event(name: &str) -> Option<(u32, u64)> {
    Some(match name {
        "cpu-cycles" | "cycles" => (PERF_TYPE_HARDWARE, 0),
        "instructions" => (PERF_TYPE_HARDWARE, 1),
        "cache-references" => (PERF_TYPE_HARDWARE, 2),
        "cache-misses" => (PERF_TYPE_HARDWARE, 3),
        "branch-instructions" | "branches" => (PERF_TYPE_HARDWARE, 4),
        "branch-misses" => (PERF_TYPE_HARDWARE, 5),
        "bus-cycles" => (PERF_TYPE_HARDWARE, 6),
        "stalled-cycles-frontend" | "idle-cycles-frontend" => (PERF_TYPE_HARDWARE, 7),
        "stalled-cycles-backend" | "idle-cycles-backend" => (PERF_TYPE_HARDWARE, 8),
        "ref-cycles" => (PERF_TYPE_HARDWARE, 9),

        "cpu-clock" => (PERF_TYPE_SOFTWARE, 0),
        "task-clock" => (PERF_TYPE_SOFTWARE, 1),
        "page-faults" | "faults" => (PERF_TYPE_SOFTWARE, 2),
        "context-switches" | "cs" => (PERF_TYPE_SOFTWARE, 3),
        "cpu-migrations" | "migrations" => (PERF_TYPE_SOFTWARE, 4),
        "minor-faults" => (PERF_TYPE_SOFTWARE, 5),
        "major-faults" => (PERF_TYPE_SOFTWARE, 6),
        "alignment-faults" => (PERF_TYPE_SOFTWARE, 7),
        "emulation-faults" => (PERF_TYPE_SOFTWARE, 8),

        "L1-dcache-loads" => (PERF_TYPE_HW_CACHE, cache_config(CACHE_L1D, HW_CACHE_READ, HW_CACHE_RESULT_ACCESS)),
        "L1-dcache-load-misses" => (PERF_TYPE_HW_CACHE, cache_config(CACHE_L1D, HW_CACHE_READ, HW_CACHE_RESULT_MISS)),
        "L1-dcache-stores" => (PERF_TYPE_HW_CACHE, cache_config(CACHE_L1D, HW_CACHE_WRITE, HW_CACHE_RESULT_ACCESS)),
        "L1-icache-loads" => (PERF_TYPE_HW_CACHE, cache_config(CACHE_L1I, HW_CACHE_READ, HW_CACHE_RESULT_ACCESS)),
        "L1-icache-load-misses" => (PERF_TYPE_HW_CACHE, cache_config(CACHE_L1I, HW_CACHE_READ, HW_CACHE_RESULT_MISS)),
        "LLC-loads" => (PERF_TYPE_HW_CACHE, cache_config(CACHE_LL, HW_CACHE_READ, HW_CACHE_RESULT_ACCESS)),
        "LLC-load-misses" => (PERF_TYPE_HW_CACHE, cache_config(CACHE_LL, HW_CACHE_READ, HW_CACHE_RESULT_MISS)),
        "LLC-stores" => (PERF_TYPE_HW_CACHE, cache_config(CACHE_LL, HW_CACHE_WRITE, HW_CACHE_RESULT_ACCESS)),
        "dTLB-loads" => (PERF_TYPE_HW_CACHE, cache_config(CACHE_DTLB, HW_CACHE_READ, HW_CACHE_RESULT_ACCESS)),
        "dTLB-load-misses" => (PERF_TYPE_HW_CACHE, cache_config(CACHE_DTLB, HW_CACHE_READ, HW_CACHE_RESULT_MISS)),

        _ => return None,
    })
}

fn parse_hex_or_dec(s: &str) -> Option<u64> {
    s.strip_prefix("0x")
        .and_then(|h| u64::from_str_radix(h, 16).ok())
        .or_else(|| s.parse::<u64>().ok())
}

/// Parses a `/sys/bus/event_source/devices/<dev>/events/<name>` descriptor
/// file (e.g. `event=0xcd,umask=0x01`) into config bits by consulting each
/// term's bit range in the sibling `format/` directory (e.g.
/// `format/umask` containing `config:8-15`).
fn parse_sysfs_event(events_path: &Path) -> Result<ResolvedSensor, AutopinError> {
    let descriptor = fs::read_to_string(events_path)
        .map_err(|e| errors::bad_config("sensor", format!("{}: {e}", events_path.display())))?;

    let format_dir = events_path
        .parent()
        .and_then(|events_dir| events_dir.parent())
        .map(|device_dir| device_dir.join("format"))
        .ok_or_else(|| errors::bad_config("sensor", format!("{} has no device/format directory", events_path.display())))?;

    let mut resolved = ResolvedSensor {
        attr_type: PERF_TYPE_RAW,
        config: 0,
        config1: 0,
        config2: 0,
    };

    for term in descriptor.trim().split(',') {
        let (field, value) = term.split_once('=').unwrap_or((term, "1"));
        let value = parse_hex_or_dec(value)
            .ok_or_else(|| errors::bad_config("sensor", format!("bad term value in {term:?}")))?;

        let spec = fs::read_to_string(format_dir.join(field))
            .map_err(|e| errors::bad_config("sensor", format!("{}: {e}", format_dir.join(field).display())))?;
        let spec = spec.trim();
        let (word, range) = spec
            .split_once(':')
            .ok_or_else(|| errors::bad_config("sensor", format!("malformed format spec {spec:?}")))?;
        let (lo, hi) = match range.split_once('-') {
            Some((lo, hi)) => (
                lo.parse::<u32>().map_err(|e| errors::bad_config("sensor", e.to_string()))?,
                hi.parse::<u32>().map_err(|e| errors::bad_config("sensor", e.to_string()))?,
            ),
            None => {
                let bit = range.parse::<u32>().map_err(|e| errors::bad_config("sensor", e.to_string()))?;
                (bit, bit)
            }
        };
        let width = hi - lo + 1;
        let mask = if width >= 64 { u64::MAX } else { (1u64 << width) - 1 };
        let shifted = (value & mask) << lo;

        match word {
            "config" => resolved.config |= shifted,
            "config1" => resolved.config1 |= shifted,
            "config2" => resolved.config2 |= shifted,
            other => return Err(errors::bad_config("sensor", format!("unknown format word {other}"))),
        }
    }

    Ok(resolved)
}

/// Resolves a `name.sensor` descriptor string to its `(type, config, config1,
/// config2)`. Three forms, tried in order: a sysfs events path (starts with
/// `/`), a symbolic name from the closed table, or a raw `config[:config1[:config2]]`
/// tuple in hex or decimal.
pub fn resolve_sensor(descriptor: &str) -> Result<ResolvedSensor, AutopinError> {
    if let Some(path) = descriptor.strip_prefix('/') {
        return parse_sysfs_event(Path::new("/").join(path).as_path());
    }
    if let Some((attr_type, config)) = symbolic_event(descriptor) {
        return Ok(ResolvedSensor {
            attr_type,
            config,
            config1: 0,
            config2: 0,
        });
    }
    let mut parts = descriptor.split(':');
    let config = parts
        .next()
        .and_then(parse_hex_or_dec)
        .ok_or_else(|| errors::bad_config("sensor", format!("unrecognized sensor descriptor {descriptor:?}")))?;
    let config1 = parts.next().and_then(parse_hex_or_dec).unwrap_or(0);
    let config2 = parts.next().and_then(parse_hex_or_dec).unwrap_or(0);
    Ok(ResolvedSensor {
        attr_type: PERF_TYPE_RAW,
        config,
        config1,
        config2,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbolic_hardware_name_resolves() {
        let r = resolve_sensor("cache-misses").unwrap();
        assert_eq!(r.attr_type, PERF_TYPE_HARDWARE);
        assert_eq!(r.config, 3);
    }

    #[test]
    fn symbolic_cache_name_packs_op_and_result_bits() {
        let r = resolve_sensor("LLC-load-misses").unwrap();
        assert_eq!(r.attr_type, PERF_TYPE_HW_CACHE);
        assert_eq!(r.config, cache_config(CACHE_LL, HW_CACHE_READ, HW_CACHE_RESULT_MISS));
    }

    #[test]
    fn raw_tuple_descriptor_still_works() {
        let r = resolve_sensor("0x1cd:0x03").unwrap();
        assert_eq!(r.attr_type, PERF_TYPE_RAW);
        assert_eq!(r.config, 0x1cd);
        assert_eq!(r.config1, 0x03);
    }

    #[test]
    fn sysfs_format_file_shifts_value_into_its_field() {
        let dir = tempfile::tempdir().unwrap();
        let device_dir = dir.path().join("cpu");
        std::fs::create_dir_all(device_dir.join("events")).unwrap();
        std::fs::create_dir_all(device_dir.join("format")).unwrap();
        std::fs::write(device_dir.join("events/mem-loads"), "event=0x81,umask=0x01\n").unwrap();
        std::fs::write(device_dir.join("format/event"), "config:0-7\n").unwrap();
        std::fs::write(device_dir.join("format/umask"), "config:8-15\n").unwrap();

        let resolved = parse_sysfs_event(&device_dir.join("events/mem-loads")).unwrap();
        assert_eq!(resolved.config, 0x81 | (0x01 << 8));
    }

    #[test]
    fn unrecognized_descriptor_is_a_bad_config_error() {
        assert!(resolve_sensor("not-a-real-event").is_err());
    }
}
