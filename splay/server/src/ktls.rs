//! Kernel TLS upgrade for established stream sockets.
//!
//! The TLS handshake itself happens elsewhere; once both traffic secrets
//! are known this module pushes them into the kernel so subsequent reads
//! and writes on the fd are plain byte operations. The caller pairs the
//! upgrade with a single backend re-registration under the KTLS kind tag.

use splay_common::Fd;
use std::io;
use std::mem;

const SOL_TLS: libc::c_int = 282;
const TLS_TX: libc::c_int = 1;
const TLS_RX: libc::c_int = 2;
const TLS_1_2_VERSION: u16 = 0x0303;
const TLS_CIPHER_AES_GCM_128: u16 = 51;

/// One direction's AES-128-GCM traffic secret, as sniffed from the
/// handshake keylog.
#[derive(Clone, Debug, Default)]
pub struct TlsDirection {
    pub key: [u8; 16],
    pub iv: [u8; 8],
    pub salt: [u8; 4],
    pub seq: [u8; 8],
}

/// Both traffic secrets of an established session.
#[derive(Clone, Debug, Default)]
pub struct TlsSecrets {
    pub tx: TlsDirection,
    pub rx: TlsDirection,
}

#[repr(C)]
struct TlsCryptoInfo {
    version: u16,
    cipher_type: u16,
}

#[repr(C)]
struct Tls12AesGcm128 {
    info: TlsCryptoInfo,
    iv: [u8; 8],
    key: [u8; 16],
    salt: [u8; 4],
    rec_seq: [u8; 8],
}

impl Tls12AesGcm128 {
    fn from_direction(direction: &TlsDirection) -> Self {
        Self {
            info: TlsCryptoInfo {
                version: TLS_1_2_VERSION,
                cipher_type: TLS_CIPHER_AES_GCM_128,
            },
            iv: direction.iv,
            key: direction.key,
            salt: direction.salt,
            rec_seq: direction.seq,
        }
    }
}

fn set_tls_opt(fd: Fd, opt: libc::c_int, info: &Tls12AesGcm128) -> io::Result<()> {
    let res = unsafe {
        libc::setsockopt(
            fd,
            SOL_TLS,
            opt,
            info as *const Tls12AesGcm128 as *const libc::c_void,
            mem::size_of::<Tls12AesGcm128>() as libc::socklen_t,
        )
    };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Enables the kernel TLS ULP and installs both traffic secrets. After a
/// successful return the fd must be re-registered under the KTLS kind in
/// one backend call so no event is delivered under a stale tag.
pub fn enable(fd: Fd, secrets: &TlsSecrets) -> io::Result<()> {
    let ulp = b"tls\0";
    let res = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_TCP,
            libc::TCP_ULP,
            ulp.as_ptr() as *const libc::c_void,
            3,
        )
    };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }

    set_tls_opt(fd, TLS_TX, &Tls12AesGcm128::from_direction(&secrets.tx))?;
    set_tls_opt(fd, TLS_RX, &Tls12AesGcm128::from_direction(&secrets.rx))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypto_info_layout_matches_the_kernel_abi() {
        // 2 + 2 header bytes, then iv, key, salt and record sequence.
        assert_eq!(mem::size_of::<TlsCryptoInfo>(), 4);
        assert_eq!(mem::size_of::<Tls12AesGcm128>(), 4 + 8 + 16 + 4 + 8);
    }

    #[test]
    fn upgrade_on_a_plain_socket_is_rejected_by_the_kernel() {
        use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
        use std::os::fd::AsRawFd;

        let (a, _b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .expect("socketpair");
        // The TLS ULP only attaches to TCP sockets; the error must surface
        // instead of leaving the fd in a half-upgraded state.
        assert!(enable(a.as_raw_fd(), &TlsSecrets::default()).is_err());
    }
}
