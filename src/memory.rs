//! Page-granular guest address space.
//!
//! The emulator core sees guest memory through a fixed mapping interface:
//! read/write/zero/copy, map/unmap/protect, free-space search, bounded
//! C-string reads and the program break. Pages are 4 KiB regardless of the
//! host page size; addresses are guest-sized (32-bit).

use crate::log::LogLevel::LogDebug;
use memchr::memchr;
use nix::unistd::mkstemp;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::os::unix::io::FromRawFd;
use std::path::PathBuf;
use std::rc::Rc;

pub const MEM_PAGE_SHIFT: u32 = 12;
pub const MEM_PAGE_SIZE: u32 = 1 << MEM_PAGE_SHIFT;
pub const MEM_PAGE_MASK: u32 = !(MEM_PAGE_SIZE - 1);

pub type MemorySharedPtr = Rc<RefCell<Memory>>;

bitflags! {
    /// Per-page permission bits. `INIT` is a transient first-touch marker:
    /// it lets the loader and file-backed `mmap` population write pages that
    /// are otherwise read-only, and is cleared on the first ordinary access.
    pub struct Access: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXEC = 0x4;
        const INIT = 0x8;
    }
}

pub fn page_align_down(addr: u32) -> u32 {
    addr & MEM_PAGE_MASK
}

pub fn page_round_up(value: u32) -> u32 {
    value
        .checked_add(MEM_PAGE_SIZE - 1)
        .unwrap_or_else(|| fatal!("address computation overflows the guest address space"))
        & MEM_PAGE_MASK
}

struct Page {
    data: Box<[u8]>,
    perms: Access,
}

impl Page {
    fn new(perms: Access) -> Page {
        Page {
            data: vec![0u8; MEM_PAGE_SIZE as usize].into_boxed_slice(),
            perms,
        }
    }
}

pub struct Memory {
    pages: BTreeMap<u32, Page>,
    pub heap_break: u32,
}

impl Memory {
    pub fn new() -> Memory {
        Memory {
            pages: BTreeMap::new(),
            heap_break: 0,
        }
    }

    pub fn shared(self) -> MemorySharedPtr {
        Rc::new(RefCell::new(self))
    }

    /// Deep copy for a no-`CLONE_VM` clone: the child must not observe
    /// subsequent writes by the parent.
    pub fn duplicate(&self) -> Memory {
        let mut pages = BTreeMap::new();
        for (&tag, page) in &self.pages {
            let mut copy = Page::new(page.perms);
            copy.data.copy_from_slice(&page.data);
            pages.insert(tag, copy);
        }
        Memory {
            pages,
            heap_break: self.heap_break,
        }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn page_perms(&self, addr: u32) -> Option<Access> {
        self.pages.get(&page_align_down(addr)).map(|p| p.perms)
    }

    pub fn is_mapped(&self, addr: u32) -> bool {
        self.pages.contains_key(&page_align_down(addr))
    }

    fn range_has_mapped_page(&self, addr: u32, size: u32) -> bool {
        let start = page_align_down(addr) as u64;
        let end = addr as u64 + size as u64;
        self.pages
            .range(start as u32..)
            .next()
            .map_or(false, |(&tag, _)| (tag as u64) < end)
    }

    /// Map `[addr, addr+size)` with `perms`, allocating zeroed pages where
    /// none exist and resetting the permissions of pages already present.
    pub fn map(&mut self, addr: u32, size: u32, perms: Access) {
        debug_assert_eq!(addr & !MEM_PAGE_MASK, 0);
        let end = addr as u64 + page_round_up(size) as u64;
        let mut tag = addr as u64;
        while tag < end {
            self.pages
                .entry(tag as u32)
                .or_insert_with(|| Page::new(perms))
                .perms = perms;
            tag += MEM_PAGE_SIZE as u64;
        }
    }

    pub fn unmap(&mut self, addr: u32, size: u32) {
        debug_assert_eq!(addr & !MEM_PAGE_MASK, 0);
        let end = addr as u64 + page_round_up(size) as u64;
        let mut tag = addr as u64;
        while tag < end {
            self.pages.remove(&(tag as u32));
            tag += MEM_PAGE_SIZE as u64;
        }
    }

    /// Update permissions over a range; pages not present are skipped.
    pub fn protect(&mut self, addr: u32, size: u32, perms: Access) {
        let end = addr as u64 + page_round_up(size) as u64;
        let mut tag = page_align_down(addr) as u64;
        while tag < end {
            if let Some(page) = self.pages.get_mut(&(tag as u32)) {
                page.perms = perms;
            }
            tag += MEM_PAGE_SIZE as u64;
        }
    }

    /// Lowest free run of `size` bytes starting at or above `addr`.
    pub fn map_space(&self, addr: u32, size: u32) -> Option<u32> {
        let size = page_round_up(size);
        let mut start = page_align_down(addr) as u64;
        loop {
            if start + size as u64 > 1u64 << 32 {
                return None;
            }
            match self.first_mapped_in(start, size) {
                None => return Some(start as u32),
                // Restart the search above the conflicting page.
                Some(tag) => start = tag as u64 + MEM_PAGE_SIZE as u64,
            }
        }
    }

    /// Highest free run of `size` bytes starting at or below `addr`,
    /// searching downward. This is the placement policy for non-fixed
    /// `mmap`: the allocator grows the mapped area toward low addresses.
    pub fn map_space_down(&self, addr: u32, size: u32) -> Option<u32> {
        let size = page_round_up(size);
        let mut start = page_align_down(addr) as i64;
        while start >= 0 {
            if start as u64 + size as u64 <= 1u64 << 32 {
                match self.first_mapped_in(start as u64, size) {
                    None => return Some(start as u32),
                    // Jump past the conflict so the run below it is tried next.
                    Some(tag) => {
                        start = tag as i64 - size as i64;
                        continue;
                    }
                }
            }
            start -= MEM_PAGE_SIZE as i64;
        }
        None
    }

    fn first_mapped_in(&self, start: u64, size: u32) -> Option<u32> {
        let end = start + size as u64;
        self.pages
            .range(start as u32..)
            .next()
            .map(|(&tag, _)| tag)
            .filter(|&tag| (tag as u64) < end)
    }

    fn page_for_access(&mut self, tag: u32, access: Access) -> &mut Page {
        let page = match self.pages.get_mut(&tag) {
            Some(page) => page,
            None => fatal!("guest access to unmapped page {:#010x}", tag),
        };
        if access == Access::INIT {
            if !page.perms.contains(Access::INIT) {
                fatal!("init write to already-initialized page {:#010x}", tag);
            }
            return page;
        }
        if !page.perms.contains(access) {
            fatal!(
                "guest access violation at page {:#010x}: needs {:?}, page is {:?}",
                tag,
                access,
                page.perms
            );
        }
        // First ordinary touch retires the load-time marker.
        page.perms.remove(Access::INIT);
        page
    }

    pub fn read(&mut self, addr: u32, buf: &mut [u8]) {
        let len = buf.len();
        let mut offset = 0usize;
        while offset < len {
            let cur = addr as u64 + offset as u64;
            if cur >= 1u64 << 32 {
                fatal!("guest read beyond the 32-bit address space");
            }
            let tag = page_align_down(cur as u32);
            let in_page = (cur as u32 - tag) as usize;
            let chunk = (MEM_PAGE_SIZE as usize - in_page).min(len - offset);
            let page = self.page_for_access(tag, Access::READ);
            buf[offset..offset + chunk].copy_from_slice(&page.data[in_page..in_page + chunk]);
            offset += chunk;
        }
    }

    pub fn write(&mut self, addr: u32, buf: &[u8]) {
        self.write_access(addr, buf, Access::WRITE)
    }

    /// Population write used while loading file-backed mappings: goes through
    /// the `INIT` permission instead of `WRITE`.
    pub fn write_init(&mut self, addr: u32, buf: &[u8]) {
        self.write_access(addr, buf, Access::INIT)
    }

    fn write_access(&mut self, addr: u32, buf: &[u8], access: Access) {
        let len = buf.len();
        let mut offset = 0usize;
        while offset < len {
            let cur = addr as u64 + offset as u64;
            if cur >= 1u64 << 32 {
                fatal!("guest write beyond the 32-bit address space");
            }
            let tag = page_align_down(cur as u32);
            let in_page = (cur as u32 - tag) as usize;
            let chunk = (MEM_PAGE_SIZE as usize - in_page).min(len - offset);
            let page = self.page_for_access(tag, access);
            page.data[in_page..in_page + chunk].copy_from_slice(&buf[offset..offset + chunk]);
            offset += chunk;
        }
    }

    pub fn zero(&mut self, addr: u32, size: u32) {
        let zeros = vec![0u8; size as usize];
        self.write(addr, &zeros);
    }

    /// Page-aligned region copy used by `mremap` relocation. Bypasses
    /// permission checks: both regions are emulator-managed at that point.
    pub fn copy(&mut self, dest: u32, src: u32, size: u32) {
        debug_assert_eq!(dest & !MEM_PAGE_MASK, 0);
        debug_assert_eq!(src & !MEM_PAGE_MASK, 0);
        let mut offset = 0u64;
        while offset < size as u64 {
            let chunk = (MEM_PAGE_SIZE as u64).min(size as u64 - offset) as usize;
            let from = match self.pages.get(&((src as u64 + offset) as u32)) {
                Some(page) => page.data[..chunk].to_vec(),
                None => fatal!("copy from unmapped page {:#010x}", src as u64 + offset),
            };
            match self.pages.get_mut(&((dest as u64 + offset) as u32)) {
                Some(page) => page.data[..chunk].copy_from_slice(&from),
                None => fatal!("copy to unmapped page {:#010x}", dest as u64 + offset),
            }
            offset += MEM_PAGE_SIZE as u64;
        }
    }

    pub fn read_u32(&mut self, addr: u32) -> u32 {
        let mut b = [0u8; 4];
        self.read(addr, &mut b);
        u32::from_le_bytes(b)
    }

    pub fn write_u32(&mut self, addr: u32, value: u32) {
        self.write(addr, &value.to_le_bytes());
    }

    /// Bounded C-string read. Returns `None` when no NUL terminator was found
    /// within `max` bytes; callers treat that as a marshalling overflow.
    pub fn read_string(&mut self, addr: u32, max: usize) -> Option<String> {
        let mut out = Vec::new();
        let mut cur = addr;
        while out.len() < max {
            let tag = page_align_down(cur);
            let in_page = (cur - tag) as usize;
            let chunk = (MEM_PAGE_SIZE as usize - in_page).min(max - out.len());
            let mut buf = vec![0u8; chunk];
            self.read(cur, &mut buf);
            match memchr(0, &buf) {
                Some(nul) => {
                    out.extend_from_slice(&buf[..nul]);
                    return Some(String::from_utf8_lossy(&out).into_owned());
                }
                None => {
                    out.extend_from_slice(&buf);
                    cur = cur.wrapping_add(chunk as u32);
                }
            }
        }
        None
    }

    /// Render the current map in `/proc/self/maps` format into a fresh
    /// temporary host file; the caller owns (and eventually unlinks) it.
    pub fn write_proc_self_maps(&self) -> std::io::Result<PathBuf> {
        let (fd, path) = mkstemp("/tmp/vx86-maps-XXXXXX")
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        let mut file = unsafe { File::from_raw_fd(fd) };
        for (start, end, perms) in self.regions() {
            writeln!(
                file,
                "{:08x}-{:08x} {}{}{}p 00000000 00:00 0",
                start,
                end,
                if perms.contains(Access::READ) { 'r' } else { '-' },
                if perms.contains(Access::WRITE) { 'w' } else { '-' },
                if perms.contains(Access::EXEC) { 'x' } else { '-' },
            )?;
        }
        log!(LogDebug, "memory map dumped to {}", path.display());
        Ok(path)
    }

    /// Contiguous runs of equal permissions, as (start, end, perms).
    pub fn regions(&self) -> Vec<(u32, u64, Access)> {
        let mut out: Vec<(u32, u64, Access)> = Vec::new();
        for (&tag, page) in &self.pages {
            match out.last_mut() {
                Some((_, end, perms))
                    if *end == tag as u64 && *perms == page.perms =>
                {
                    *end += MEM_PAGE_SIZE as u64;
                }
                _ => out.push((tag, tag as u64 + MEM_PAGE_SIZE as u64, page.perms)),
            }
        }
        out
    }

    /// Program-break growth: pages from the old aligned break to the new one
    /// become RW, but only if the whole range is currently free.
    pub fn grow_heap(&mut self, old_aligned: u32, size: u32) -> bool {
        if self.range_has_mapped_page(old_aligned, size) {
            return false;
        }
        self.map(old_aligned, size, Access::READ | Access::WRITE);
        true
    }
}

impl Default for Memory {
    fn default() -> Memory {
        Memory::new()
    }
}
