use crate::error::{PatchError, Result};

/// One anonymous mapping handed out by [`CodeAllocator`]. Never unmapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeSlice {
    pub base: usize,
    pub size: usize,
}

impl CodeSlice {
    pub fn end(&self) -> usize {
        self.base + self.size
    }

    pub fn contains(&self, addr: usize) -> bool {
        (self.base..self.end()).contains(&addr)
    }
}

#[inline]
pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn map_failed(what: &str) -> PatchError {
    PatchError::Allocation(format!("{what}: {}", std::io::Error::last_os_error()))
}

#[derive(Debug)]
pub struct CodeAllocator {
    slab_size: usize,
}

impl Default for CodeAllocator {
    fn default() -> Self {
        Self { slab_size: 64 * 1024 }
    }
}

impl CodeAllocator {
    pub fn new(slab_size: usize) -> Self {
        let page = page_size();
        Self { slab_size: slab_size.max(page).next_multiple_of(page) }
    }

    pub fn slab_size(&self) -> usize {
        self.slab_size
    }

    fn rounded(&self, size: usize) -> usize {
        size.max(self.slab_size).next_multiple_of(page_size())
    }

    /// Map at least `size` bytes within `max_distance` of `near`.
    ///
    /// Returns `Ok(None)` when no gap in the window can hold the mapping.
    pub fn alloc_near(&self, near: usize, max_distance: usize, size: usize) -> Result<Option<CodeSlice>> {
        let need = self.rounded(size);

        #[cfg(target_os = "linux")]
        unsafe {
            let page_sz = page_size();
            let win_start = near.saturating_sub(max_distance).max(page_sz) & !(page_sz - 1);
            let win_end = near.saturating_add(max_distance) & !(page_sz - 1);

            let try_map = |gap_start: usize, gap_end: usize| -> Option<CodeSlice> {
                if gap_end <= gap_start || gap_end - gap_start < need {
                    return None;
                }
                let candidate = near.clamp(gap_start, gap_end - need) & !(page_sz - 1);
                if candidate < gap_start {
                    return None;
                }
                let ptr = libc::mmap(
                    candidate as *mut libc::c_void,
                    need,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
                    -1,
                    0,
                );
                if ptr == libc::MAP_FAILED {
                    return None;
                }
                // Kernels before 4.17 ignore MAP_FIXED_NOREPLACE and may place it elsewhere.
                if ptr as usize != candidate {
                    libc::munmap(ptr, need);
                    return None;
                }
                Some(CodeSlice { base: ptr as usize, size: need })
            };

            let regions = linux_maps();
            let mut prev_end = win_start;
            for region in &regions {
                if region.start > win_end {
                    break;
                }
                if region.start > prev_end {
                    if let Some(slice) = try_map(prev_end, region.start.min(win_end)) {
                        return Ok(Some(slice));
                    }
                }
                prev_end = prev_end.max(region.end);
            }
            if prev_end < win_end {
                if let Some(slice) = try_map(prev_end, win_end) {
                    return Ok(Some(slice));
                }
            }
            Ok(None)
        }

        #[cfg(target_os = "macos")]
        unsafe {
            use mach2::kern_return::KERN_SUCCESS;
            use mach2::traps::mach_task_self;
            use mach2::vm::mach_vm_allocate;
            use mach2::vm_region::{vm_region_basic_info_64, VM_REGION_BASIC_INFO_64};
            use mach2::vm_statistics::VM_FLAGS_FIXED;
            use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t};

            let task = mach_task_self();
            let page_sz = page_size() as u64;
            let near_u = near as u64;
            let win_start = near_u.saturating_sub(max_distance as u64) & !(page_sz - 1);
            let win_end = near_u.saturating_add(max_distance as u64) & !(page_sz - 1);
            let need = need as u64;

            let mut addr: mach_vm_address_t = win_start;
            let mut prev_end: u64 = win_start;
            while addr < win_end {
                let mut region_addr = addr;
                let mut region_size: mach_vm_size_t = 0;
                let mut info: vm_region_basic_info_64 = core::mem::zeroed();
                let mut info_count = vm_region_basic_info_64::count();
                let mut object_name: u32 = 0;
                let kr = mach2::vm::mach_vm_region(
                    task,
                    &mut region_addr,
                    &mut region_size,
                    VM_REGION_BASIC_INFO_64,
                    (&mut info as *mut _) as mach2::vm_region::vm_region_info_t,
                    &mut info_count,
                    &mut object_name,
                );
                if kr != KERN_SUCCESS {
                    break;
                }
                if region_addr > prev_end {
                    let gap_end = region_addr.min(win_end);
                    if gap_end > prev_end && gap_end - prev_end >= need {
                        let candidate = near_u.clamp(prev_end, gap_end - need) & !(page_sz - 1);
                        let mut out = candidate as mach_vm_address_t;
                        if mach_vm_allocate(task, &mut out, need, VM_FLAGS_FIXED) == KERN_SUCCESS {
                            return Ok(Some(CodeSlice { base: out as usize, size: need as usize }));
                        }
                    }
                }
                let region_end = region_addr.saturating_add(region_size);
                prev_end = prev_end.max(region_end);
                addr = region_end;
            }
            Ok(None)
        }

        #[cfg(not(any(target_os = "macos", target_os = "linux")))]
        {
            let _ = (near, max_distance, need);
            Ok(None)
        }
    }

    /// Map at least `size` read-write bytes anywhere.
    pub fn alloc_any(&self, size: usize) -> Result<CodeSlice> {
        let need = self.rounded(size);
        unsafe {
            let ptr = libc::mmap(
                core::ptr::null_mut(),
                need,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                return Err(map_failed("mmap"));
            }
            Ok(CodeSlice { base: ptr as usize, size: need })
        }
    }

    /// Flip a fresh slice to R-X.
    ///
    /// # Safety
    /// `slice` must come from this allocator.
    pub unsafe fn make_executable(&self, slice: &CodeSlice) -> Result<()> {
        if libc::mprotect(slice.base as *mut libc::c_void, slice.size, libc::PROT_READ | libc::PROT_EXEC) != 0 {
            return Err(PatchError::Protection { addr: slice.base, errno: last_errno() });
        }
        crate::code::cache::invalidate_icache(slice.base as *mut u8, slice.size);
        Ok(())
    }
}

pub(crate) fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[cfg(target_os = "linux")]
#[derive(Debug, Clone, Copy)]
struct MapsRegion {
    start: usize,
    end: usize,
    readable: bool,
}

#[cfg(target_os = "linux")]
fn linux_maps() -> Vec<MapsRegion> {
    let Ok(maps) = std::fs::read_to_string("/proc/self/maps") else {
        return Vec::new();
    };
    let mut regions: Vec<MapsRegion> = maps
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let (start_s, end_s) = fields.next()?.split_once('-')?;
            let perms = fields.next()?;
            Some(MapsRegion {
                start: usize::from_str_radix(start_s, 16).ok()?,
                end: usize::from_str_radix(end_s, 16).ok()?,
                readable: perms.starts_with('r'),
            })
        })
        .collect();
    regions.sort_by_key(|r| r.start);
    regions
}

/// Bytes readable from `addr` up to the end of its (contiguous, readable) mapping.
pub fn readable_extent(addr: usize) -> Option<usize> {
    #[cfg(target_os = "linux")]
    {
        let regions = linux_maps();
        let idx = regions.iter().position(|r| r.readable && (r.start..r.end).contains(&addr))?;
        let mut end = regions[idx].end;
        for r in &regions[idx + 1..] {
            if r.start != end || !r.readable {
                break;
            }
            end = r.end;
        }
        Some(end - addr)
    }

    #[cfg(target_os = "macos")]
    unsafe {
        use mach2::kern_return::KERN_SUCCESS;
        use mach2::traps::mach_task_self;
        use mach2::vm_prot::VM_PROT_READ;
        use mach2::vm_region::{vm_region_basic_info_64, VM_REGION_BASIC_INFO_64};
        use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t};

        let mut region_addr = addr as mach_vm_address_t;
        let mut region_size: mach_vm_size_t = 0;
        let mut info: vm_region_basic_info_64 = core::mem::zeroed();
        let mut info_count = vm_region_basic_info_64::count();
        let mut object_name: u32 = 0;
        let kr = mach2::vm::mach_vm_region(
            mach_task_self(),
            &mut region_addr,
            &mut region_size,
            VM_REGION_BASIC_INFO_64,
            (&mut info as *mut _) as mach2::vm_region::vm_region_info_t,
            &mut info_count,
            &mut object_name,
        );
        if kr != KERN_SUCCESS || region_addr as usize > addr || info.protection & VM_PROT_READ == 0 {
            return None;
        }
        Some((region_addr + region_size) as usize - addr)
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        let _ = addr;
        None
    }
}
