// src/interception/preload.rs
//! LD_PRELOAD / DYLD_INSERT_LIBRARIES shim
//!
//! Only compiled with `--features preload`. The resulting cdylib exports
//! `connect` and `getaddrinfo`, which shadow libc's for the whole process.
//! Originals are resolved lazily with `dlsym(RTLD_NEXT)`; that first
//! resolution is the bind recorded in `NativeHookTable`.
//!
//! Blocks surface as `-1` / `errno = EACCES` from `connect` and `EAI_FAIL`
//! from `getaddrinfo`.

use crate::interception::bridge::c_str;
use crate::interception::native_hook::{NativeEntryPoint, NativeHookTable};
use crate::observability;
use crate::utils::config::AirgapConfig;
use libc::{addrinfo, c_char, c_int, c_void, sockaddr, socklen_t};
use std::ffi::CString;
use std::mem::size_of;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::panic::{self, AssertUnwindSafe};
use tracing::warn;

type ConnectFn = unsafe extern "C" fn(c_int, *const sockaddr, socklen_t) -> c_int;
type GetAddrInfoFn = unsafe extern "C" fn(
    *const c_char,
    *const c_char,
    *const addrinfo,
    *mut *mut addrinfo,
) -> c_int;

#[used]
#[cfg_attr(any(target_os = "linux", target_os = "android"), link_section = ".init_array")]
#[cfg_attr(target_os = "macos", link_section = "__DATA,__mod_init_func")]
static ON_LOAD: extern "C" fn() = on_load;

extern "C" fn on_load() {
    let _ = panic::catch_unwind(|| {
        let _ = observability::init_tracing(&AirgapConfig::global().logging);
        NativeHookTable::global().install();
    });
}

/// Original of `entry`, resolving and binding it on first use
unsafe fn original(table: &NativeHookTable, entry: NativeEntryPoint) -> Option<usize> {
    if let Some(address) = table.original(entry) {
        return Some(address);
    }

    let name = CString::new(entry.symbol()).ok()?;
    let address = libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) as usize;
    if address == 0 {
        return None;
    }
    table.bind(entry, address);
    // a racing bind may have stored first; both resolved the same symbol
    table.original(entry).or(Some(address))
}

#[no_mangle]
pub unsafe extern "C" fn connect(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int {
    connect_through(NativeHookTable::global(), fd, addr, len)
}

#[no_mangle]
pub unsafe extern "C" fn getaddrinfo(
    node: *const c_char,
    service: *const c_char,
    hints: *const addrinfo,
    res: *mut *mut addrinfo,
) -> c_int {
    getaddrinfo_through(NativeHookTable::global(), node, service, hints, res)
}

unsafe fn connect_through(
    table: &NativeHookTable,
    fd: c_int,
    addr: *const sockaddr,
    len: socklen_t,
) -> c_int {
    let Some(address) = original(table, NativeEntryPoint::Connect) else {
        set_errno(libc::ENOSYS);
        return -1;
    };
    let real: ConnectFn = std::mem::transmute(address as *const c_void);

    // non-IP families (AF_UNIX, AF_UNSPEC, ...) are never guarded
    if let Some(target) = socket_addr(addr, len) {
        let verdict = panic::catch_unwind(AssertUnwindSafe(|| {
            table.guard_connect(&target, NativeEntryPoint::Connect.caller_tag())
        }));
        if let Ok(Err(blocked)) = verdict {
            warn!("{}", blocked.message());
            set_errno(libc::EACCES);
            return -1;
        }
    }

    real(fd, addr, len)
}

unsafe fn getaddrinfo_through(
    table: &NativeHookTable,
    node: *const c_char,
    service: *const c_char,
    hints: *const addrinfo,
    res: *mut *mut addrinfo,
) -> c_int {
    let Some(address) = original(table, NativeEntryPoint::GetAddrInfo) else {
        return libc::EAI_FAIL;
    };
    let real: GetAddrInfoFn = std::mem::transmute(address as *const c_void);

    let host = c_str(node);
    if let Some(host) = host {
        let verdict = panic::catch_unwind(AssertUnwindSafe(|| {
            table.guard_lookup(host, NativeEntryPoint::GetAddrInfo.caller_tag())
        }));
        if let Ok(Err(blocked)) = verdict {
            warn!("{}", blocked.message());
            return libc::EAI_FAIL;
        }
    }

    let status = real(node, service, hints, res);
    if status == 0 && !res.is_null() {
        if let Some(host) = host {
            table.addresses().record(host, resolved_addresses(*res));
        }
    }
    status
}

unsafe fn resolved_addresses(mut info: *const addrinfo) -> Vec<IpAddr> {
    let mut addresses = Vec::new();
    while !info.is_null() {
        if let Some(address) = socket_addr((*info).ai_addr, (*info).ai_addrlen) {
            addresses.push(address.ip());
        }
        info = (*info).ai_next;
    }
    addresses
}

unsafe fn socket_addr(addr: *const sockaddr, len: socklen_t) -> Option<SocketAddr> {
    if addr.is_null() {
        return None;
    }
    let len = len as usize;

    match c_int::from((*addr).sa_family) {
        libc::AF_INET if len >= size_of::<libc::sockaddr_in>() => {
            let sin = &*(addr as *const libc::sockaddr_in);
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 if len >= size_of::<libc::sockaddr_in6>() => {
            let sin6 = &*(addr as *const libc::sockaddr_in6);
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::new(IpAddr::V6(ip), u16::from_be(sin6.sin6_port)))
        }
        _ => None,
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn set_errno(code: c_int) {
    *libc::__errno_location() = code;
}

#[cfg(target_os = "macos")]
unsafe fn set_errno(code: c_int) {
    *libc::__error() = code;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::store::ContextStore;
    use crate::engine::decision::DecisionEngine;
    use crate::interception::bridge::BridgeResolver;
    use crate::interception::native_hook::BindState;
    use crate::policy::configuration::Configuration;
    use std::io;
    use std::net::TcpListener;
    use std::os::unix::net::UnixListener;
    use std::sync::Arc;

    fn table_with(config: Configuration) -> NativeHookTable {
        let store = Arc::new(ContextStore::new());
        store.set_configuration(config);
        NativeHookTable::new(BridgeResolver::Fixed(Arc::new(DecisionEngine::new(store))))
    }

    fn loopback_sockaddr(port: u16) -> libc::sockaddr_in {
        let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        sin.sin_family = libc::AF_INET as libc::sa_family_t;
        sin.sin_port = port.to_be();
        sin.sin_addr.s_addr = u32::from(Ipv4Addr::LOCALHOST).to_be();
        sin
    }

    /// `connect_through` on a fresh TCP socket; returns the status and errno
    fn tcp_connect(table: &NativeHookTable, port: u16) -> (c_int, Option<i32>) {
        let sin = loopback_sockaddr(port);
        unsafe {
            let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
            assert!(fd >= 0);
            let status = connect_through(
                table,
                fd,
                &sin as *const libc::sockaddr_in as *const sockaddr,
                size_of::<libc::sockaddr_in>() as socklen_t,
            );
            let errno = io::Error::last_os_error().raw_os_error();
            libc::close(fd);
            (status, errno)
        }
    }

    fn lookup(table: &NativeHookTable, host: &str) -> (c_int, *mut addrinfo) {
        let node = CString::new(host).unwrap();
        let mut hints: addrinfo = unsafe { std::mem::zeroed() };
        hints.ai_family = libc::AF_INET;
        hints.ai_socktype = libc::SOCK_STREAM;
        let mut res: *mut addrinfo = std::ptr::null_mut();
        let status = unsafe {
            getaddrinfo_through(table, node.as_ptr(), std::ptr::null(), &hints, &mut res)
        };
        (status, res)
    }

    #[test]
    fn test_blocked_connect_fails_with_eacces() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let table = table_with(Configuration::block_all());
        table.install();

        let (status, errno) = tcp_connect(&table, port);
        assert_eq!(status, -1);
        assert_eq!(errno, Some(libc::EACCES));
        assert_eq!(table.bind_state(NativeEntryPoint::Connect), BindState::Hooked);
    }

    #[test]
    fn test_allowed_connect_reaches_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let table = table_with(Configuration::builder().allow("127.0.0.1").build().unwrap());
        table.install();

        let (status, _) = tcp_connect(&table, port);
        assert_eq!(status, 0);
        assert!(listener.accept().is_ok());
    }

    #[test]
    fn test_connect_before_install_is_unhookable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let table = table_with(Configuration::block_all());

        let (status, _) = tcp_connect(&table, port);
        assert_eq!(status, 0);
        assert_eq!(table.bind_state(NativeEntryPoint::Connect), BindState::Unhookable);

        // installing afterwards does not start guarding it
        assert!(!table.install().is_complete());
        assert_eq!(tcp_connect(&table, port).0, 0);
    }

    #[test]
    fn test_unix_socket_connect_passes_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("airgap.sock");
        let _listener = UnixListener::bind(&path).unwrap();
        let table = table_with(Configuration::block_all());
        table.install();

        let mut sun: libc::sockaddr_un = unsafe { std::mem::zeroed() };
        sun.sun_family = libc::AF_UNIX as libc::sa_family_t;
        let raw = path.to_str().unwrap().as_bytes();
        assert!(raw.len() < sun.sun_path.len());
        for (slot, byte) in sun.sun_path.iter_mut().zip(raw) {
            *slot = *byte as c_char;
        }

        let status = unsafe {
            let fd = libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0);
            assert!(fd >= 0);
            let status = connect_through(
                &table,
                fd,
                &sun as *const libc::sockaddr_un as *const sockaddr,
                size_of::<libc::sockaddr_un>() as socklen_t,
            );
            libc::close(fd);
            status
        };
        assert_eq!(status, 0);
    }

    #[test]
    fn test_blocked_lookup_fails_without_recording() {
        let table = table_with(Configuration::block_all());
        table.install();

        let (status, res) = lookup(&table, "example.com");
        assert_eq!(status, libc::EAI_FAIL);
        assert!(res.is_null());
        assert!(table.addresses().is_empty());
    }

    #[test]
    fn test_allowed_lookup_records_addresses() {
        let table = table_with(Configuration::builder().allow("localhost").build().unwrap());
        table.install();

        let (status, res) = lookup(&table, "localhost");
        assert_eq!(status, 0);
        assert!(!res.is_null());
        unsafe { libc::freeaddrinfo(res) };

        let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
        assert_eq!(table.addresses().hostnames_for(loopback), vec!["localhost".to_string()]);
        assert_eq!(table.bind_state(NativeEntryPoint::GetAddrInfo), BindState::Hooked);
    }

    #[test]
    fn test_socket_addr_v4() {
        let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        sin.sin_family = libc::AF_INET as libc::sa_family_t;
        sin.sin_port = 443u16.to_be();
        sin.sin_addr.s_addr = u32::from(Ipv4Addr::new(93, 184, 216, 34)).to_be();

        let parsed = unsafe {
            socket_addr(
                &sin as *const libc::sockaddr_in as *const sockaddr,
                size_of::<libc::sockaddr_in>() as socklen_t,
            )
        };
        assert_eq!(parsed, Some("93.184.216.34:443".parse().unwrap()));
    }

    #[test]
    fn test_socket_addr_unix_family_is_ignored() {
        let mut sun: libc::sockaddr_un = unsafe { std::mem::zeroed() };
        sun.sun_family = libc::AF_UNIX as libc::sa_family_t;

        let parsed = unsafe {
            socket_addr(
                &sun as *const libc::sockaddr_un as *const sockaddr,
                size_of::<libc::sockaddr_un>() as socklen_t,
            )
        };
        assert!(parsed.is_none());
    }

    #[test]
    fn test_truncated_sockaddr_is_ignored() {
        let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        sin.sin_family = libc::AF_INET as libc::sa_family_t;
        let parsed = unsafe { socket_addr(&sin as *const libc::sockaddr_in as *const sockaddr, 2) };
        assert!(parsed.is_none());
    }
}
