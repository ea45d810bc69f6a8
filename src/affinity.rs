//! Optional CPU-affinity binding, applied once at daemon startup (§5, §F),
//! grounded in `fg_affinity.c`.

#[cfg(target_os = "linux")]
pub fn bind_to_core(core: usize) -> std::io::Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn bind_to_core(_core: usize) -> std::io::Result<()> {
    log::warn!("CPU affinity binding is not supported on this platform");
    Ok(())
}
