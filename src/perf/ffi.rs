//! Hand-rolled `perf_event_open` ABI structures and syscall wrapper.
//!
//! No raw-bindings crate is used; the struct layout and bit positions below
//! mirror `linux/perf_event.h`, scoped to exactly the fields §4.5/§4.6 need.

use std::io;
use std::mem;

pub const PERF_TYPE_HARDWARE: u32 = 0;
pub const PERF_TYPE_SOFTWARE: u32 = 1;
pub const PERF_TYPE_HW_CACHE: u32 = 3;
pub const PERF_TYPE_RAW: u32 = 4;

pub const PERF_SAMPLE_IP: u64 = 1 << 0;
pub const PERF_SAMPLE_TID: u64 = 1 << 1;
pub const PERF_SAMPLE_TIME: u64 = 1 << 2;
pub const PERF_SAMPLE_ADDR: u64 = 1 << 3;
pub const PERF_SAMPLE_CPU: u64 = 1 << 7;
pub const PERF_SAMPLE_PERIOD: u64 = 1 << 8;
pub const PERF_SAMPLE_WEIGHT: u64 = 1 << 13;
pub const PERF_SAMPLE_DATA_SRC: u64 = 1 << 15;

/// Load-latency sample mask: `IP | TID | TIME | ADDR | CPU | PERIOD | WEIGHT | DATA_SRC`.
pub const LOAD_LATENCY_SAMPLE_TYPE: u64 = PERF_SAMPLE_IP
    | PERF_SAMPLE_TID
    | PERF_SAMPLE_TIME
    | PERF_SAMPLE_ADDR
    | PERF_SAMPLE_CPU
    | PERF_SAMPLE_PERIOD
    | PERF_SAMPLE_WEIGHT
    | PERF_SAMPLE_DATA_SRC;

const FLAG_DISABLED: u64 = 1 << 0;
const FLAG_INHERIT: u64 = 1 << 1;
const FLAG_PINNED: u64 = 1 << 2;
const FLAG_EXCLUSIVE: u64 = 1 << 3;
const FLAG_FREQ: u64 = 1 << 10;
const FLAG_SAMPLE_ID_ALL: u64 = 1 << 17;

/// `precise_ip` occupies bits 15-16 of the settings word.
const PRECISE_IP_SHIFT: u64 = 15;

/// A subset of `struct perf_event_attr`. Fields the crate never sets
/// (branch sampling, breakpoints, clock ids, AUX) are omitted rather than
/// zero-padded individually; the kernel treats a short struct of the
/// declared `size` as "fields beyond this are default".
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PerfEventAttr {
    pub attr_type: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period_or_freq: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    pub wakeup_events_or_watermark: u32,
    pub bp_type: u32,
    pub config1: u64,
    pub config2: u64,
}

impl Default for PerfEventAttr {
    fn default() -> Self {
        Self {
            attr_type: PERF_TYPE_HARDWARE,
            size: mem::size_of::<PerfEventAttr>() as u32,
            config: 0,
            sample_period_or_freq: 0,
            sample_type: 0,
            read_format: 0,
            flags: FLAG_DISABLED,
            wakeup_events_or_watermark: 0,
            bp_type: 0,
            config1: 0,
            config2: 0,
        }
    }
}

impl PerfEventAttr {
    pub fn raw(config: u64, config1: u64, config2: u64) -> Self {
        Self {
            attr_type: PERF_TYPE_RAW,
            config,
            config1,
            config2,
            ..Default::default()
        }
    }

    /// Like [`PerfEventAttr::raw`] but for a resolved symbolic or sysfs
    /// sensor, whose `attr_type` may be `PERF_TYPE_HARDWARE`/`_SOFTWARE`/`_HW_CACHE`.
    pub fn typed(attr_type: u32, config: u64, config1: u64, config2: u64) -> Self {
        Self {
            attr_type,
            config,
            config1,
            config2,
            ..Default::default()
        }
    }

    pub fn set_sample_period(&mut self, period: u64) -> &mut Self {
        self.sample_period_or_freq = period;
        self
    }

    pub fn set_freq(&mut self) -> &mut Self {
        self.flags |= FLAG_FREQ;
        self
    }

    pub fn set_sample_type(&mut self, mask: u64) -> &mut Self {
        self.sample_type = mask;
        self
    }

    pub fn set_precise_ip(&mut self, level: u64) -> &mut Self {
        self.flags = (self.flags & !(0b11 << PRECISE_IP_SHIFT)) | ((level & 0b11) << PRECISE_IP_SHIFT);
        self
    }

    pub fn inherit(&mut self) -> &mut Self {
        self.flags |= FLAG_INHERIT;
        self
    }

    pub fn pinned(&mut self) -> &mut Self {
        self.flags |= FLAG_PINNED;
        self
    }

    pub fn exclusive(&mut self) -> &mut Self {
        self.flags |= FLAG_EXCLUSIVE;
        self
    }

    pub fn sample_id_all(&mut self) -> &mut Self {
        self.flags |= FLAG_SAMPLE_ID_ALL;
        self
    }
}

/// `perf_event_open(2)`. `pid == -1, cpu >= 0` monitors everything on that
/// CPU; `pid >= 0, cpu == -1` monitors that task across CPUs.
pub fn perf_event_open(
    attr: &PerfEventAttr,
    pid: i32,
    cpu: i32,
    group_fd: i32,
    flags: u64,
) -> io::Result<i32> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            attr as *const PerfEventAttr,
            pid,
            cpu,
            group_fd,
            flags,
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as i32)
    }
}

pub const PERF_EVENT_IOC_ENABLE: u64 = 0x2400;
pub const PERF_EVENT_IOC_DISABLE: u64 = 0x2401;
pub const PERF_EVENT_IOC_RESET: u64 = 0x2403;

pub fn ioctl(fd: i32, request: u64, arg: i32) -> io::Result<()> {
    let ret = unsafe { libc::ioctl(fd, request, arg) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// The mmap ring buffer's header page. `data_head`/`data_tail` are the
/// acquire/release pair §5 specifies.
#[repr(C)]
pub struct RingBufferHeader {
    pub version: u32,
    pub compat_version: u32,
    pub lock: u32,
    pub index: u32,
    pub offset: i64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub capabilities: u64,
    pub pmc_width: u16,
    pub time_shift: u16,
    pub time_mult: u32,
    pub time_offset: u64,
    reserved: [u64; 120],
    pub data_head: u64,
    pub data_tail: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct ReadFormatSingle {
    pub value: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_size_matches_struct_size() {
        let attr = PerfEventAttr::default();
        assert_eq!(attr.size as usize, mem::size_of::<PerfEventAttr>());
    }

    #[test]
    fn raw_event_carries_config_bits() {
        let attr = PerfEventAttr::raw(0x1cd, 0x03, 0);
        assert_eq!(attr.attr_type, PERF_TYPE_RAW);
        assert_eq!(attr.config, 0x1cd);
        assert_eq!(attr.config1, 0x03);
    }

    #[test]
    fn precise_ip_occupies_its_own_bits() {
        let mut attr = PerfEventAttr::default();
        attr.set_precise_ip(1);
        assert_eq!((attr.flags >> PRECISE_IP_SHIFT) & 0b11, 1);
        attr.pinned();
        assert_eq!((attr.flags >> PRECISE_IP_SHIFT) & 0b11, 1, "pinned must not clobber precise_ip");
    }

    #[test]
    fn load_latency_sample_type_matches_spec_mask() {
        assert_eq!(
            LOAD_LATENCY_SAMPLE_TYPE,
            PERF_SAMPLE_IP
                | PERF_SAMPLE_TID
                | PERF_SAMPLE_TIME
                | PERF_SAMPLE_ADDR
                | PERF_SAMPLE_CPU
                | PERF_SAMPLE_PERIOD
                | PERF_SAMPLE_WEIGHT
                | PERF_SAMPLE_DATA_SRC
        );
    }
}
