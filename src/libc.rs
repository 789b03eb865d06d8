// Copyright 2025 Google LLC
// SPDX-License-Identifier: MIT

pub fn sysconf_nprocs() -> u64 {
    // SAFETY: valid sysconf call with validation
    let mut nprocs = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if nprocs <= 0 {
        nprocs = 1;
    }

    nprocs as _
}

#[cfg(test)]
mod tests {
    #[test]
    fn at_least_one_processor() {
        assert!(super::sysconf_nprocs() >= 1);
    }
}
