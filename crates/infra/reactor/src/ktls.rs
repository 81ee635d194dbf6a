//! Linux kernel TLS offload
//!
//! After a user-space rustls handshake, the symmetric session material is
//! extracted and installed into the socket via `TCP_ULP`/`SOL_TLS`, after
//! which the kernel transparently (de)crypts records and the session takes
//! the plain, non-TLS I/O path.
//!
//! The per-cipher `crypto_info` layouts are byte-exact contracts with the
//! kernel. Instead of a C union, each supported cipher is a variant of
//! [`KtlsCryptoInfo`] carrying exactly-sized fields, serialized in kernel
//! struct order: `{u16 version, u16 cipher_type}`, then `iv`, `key`,
//! `salt`, `rec_seq`. Any cipher outside the supported set is refused
//! before a single socket option is touched.

use rustls::{ClientConnection, ConnectionTrafficSecrets, ProtocolVersion};
use std::io;
use std::os::fd::RawFd;
use thiserror::Error;
use tracing::info;

pub(crate) const SOL_TCP: libc::c_int = 6;
pub(crate) const TCP_ULP: libc::c_int = 31;
pub(crate) const SOL_TLS: libc::c_int = 282;
pub(crate) const TLS_TX: libc::c_int = 1;
pub(crate) const TLS_RX: libc::c_int = 2;

const TLS_1_2_VERSION: u16 = 0x0303;
const TLS_1_3_VERSION: u16 = 0x0304;

const TLS_CIPHER_AES_GCM_128: u16 = 51;
const TLS_CIPHER_AES_GCM_256: u16 = 52;
const TLS_CIPHER_AES_CCM_128: u16 = 53;
const TLS_CIPHER_CHACHA20_POLY1305: u16 = 54;

/// Kernel TLS offload failure
#[derive(Debug, Error)]
pub enum KtlsError {
    /// Negotiated cipher has no kernel crypto-info layout here
    #[error("unsupported cipher for kernel TLS offload: {0}")]
    UnsupportedCipher(&'static str),

    /// Only TLS 1.2 and 1.3 records are offloadable
    #[error("unsupported protocol version for kernel TLS offload: {0:?}")]
    UnsupportedVersion(ProtocolVersion),

    /// Extracted key material had an unexpected size
    #[error("bad key material: {0}")]
    BadKeyMaterial(&'static str),

    /// Secret extraction from the user-space session failed
    #[error("secret extraction failed: {0}")]
    Extract(#[from] rustls::Error),

    /// setsockopt failure
    #[error("kernel rejected TLS offload: {0}")]
    Sys(#[from] io::Error),
}

/// TLS protocol version as the kernel expects it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KtlsVersion {
    /// TLS 1.2
    V1_2,
    /// TLS 1.3
    V1_3,
}

impl KtlsVersion {
    const fn wire(self) -> u16 {
        match self {
            Self::V1_2 => TLS_1_2_VERSION,
            Self::V1_3 => TLS_1_3_VERSION,
        }
    }

    fn from_protocol(v: ProtocolVersion) -> Result<Self, KtlsError> {
        match v {
            ProtocolVersion::TLSv1_2 => Ok(Self::V1_2),
            ProtocolVersion::TLSv1_3 => Ok(Self::V1_3),
            other => Err(KtlsError::UnsupportedVersion(other)),
        }
    }
}

/// Per-cipher kernel crypto-info, one direction (TX or RX)
#[derive(Clone, PartialEq, Eq)]
pub enum KtlsCryptoInfo {
    /// `tls12_crypto_info_aes_gcm_128`
    AesGcm128 {
        /// Record IV (explicit part)
        iv: [u8; 8],
        /// AES-128 key
        key: [u8; 16],
        /// Implicit salt
        salt: [u8; 4],
        /// Next record sequence number, big-endian
        rec_seq: [u8; 8],
    },
    /// `tls12_crypto_info_aes_gcm_256`
    AesGcm256 {
        /// Record IV (explicit part)
        iv: [u8; 8],
        /// AES-256 key
        key: [u8; 32],
        /// Implicit salt
        salt: [u8; 4],
        /// Next record sequence number, big-endian
        rec_seq: [u8; 8],
    },
    /// `tls12_crypto_info_aes_ccm_128`
    AesCcm128 {
        /// Record IV (explicit part)
        iv: [u8; 8],
        /// AES-128 key
        key: [u8; 16],
        /// Implicit salt
        salt: [u8; 4],
        /// Next record sequence number, big-endian
        rec_seq: [u8; 8],
    },
    /// `tls12_crypto_info_chacha20_poly1305` (zero-length salt)
    Chacha20Poly1305 {
        /// Full 12-byte nonce
        iv: [u8; 12],
        /// ChaCha20 key
        key: [u8; 32],
        /// Next record sequence number, big-endian
        rec_seq: [u8; 8],
    },
}

impl std::fmt::Debug for KtlsCryptoInfo {
    // Key material stays out of logs
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KtlsCryptoInfo::{}", self.cipher_name())
    }
}

impl KtlsCryptoInfo {
    /// Kernel cipher-type constant.
    #[must_use]
    pub const fn cipher_type(&self) -> u16 {
        match self {
            Self::AesGcm128 { .. } => TLS_CIPHER_AES_GCM_128,
            Self::AesGcm256 { .. } => TLS_CIPHER_AES_GCM_256,
            Self::AesCcm128 { .. } => TLS_CIPHER_AES_CCM_128,
            Self::Chacha20Poly1305 { .. } => TLS_CIPHER_CHACHA20_POLY1305,
        }
    }

    /// Human-readable cipher name.
    #[must_use]
    pub const fn cipher_name(&self) -> &'static str {
        match self {
            Self::AesGcm128 { .. } => "AES-GCM-128",
            Self::AesGcm256 { .. } => "AES-GCM-256",
            Self::AesCcm128 { .. } => "AES-CCM-128",
            Self::Chacha20Poly1305 { .. } => "CHACHA20-POLY1305",
        }
    }

    /// Build from rustls extracted secrets for one direction.
    pub fn from_secrets(
        seq: u64,
        secrets: &ConnectionTrafficSecrets,
    ) -> Result<Self, KtlsError> {
        let rec_seq = seq.to_be_bytes();
        match secrets {
            ConnectionTrafficSecrets::Aes128Gcm { key, iv } => {
                let key: [u8; 16] = key
                    .as_ref()
                    .try_into()
                    .map_err(|_| KtlsError::BadKeyMaterial("aes-128-gcm key"))?;
                let nonce: [u8; 12] = iv
                    .as_ref()
                    .try_into()
                    .map_err(|_| KtlsError::BadKeyMaterial("aes-128-gcm iv"))?;
                let mut salt = [0u8; 4];
                let mut iv8 = [0u8; 8];
                salt.copy_from_slice(&nonce[..4]);
                iv8.copy_from_slice(&nonce[4..]);
                Ok(Self::AesGcm128 { iv: iv8, key, salt, rec_seq })
            }
            ConnectionTrafficSecrets::Aes256Gcm { key, iv } => {
                let key: [u8; 32] = key
                    .as_ref()
                    .try_into()
                    .map_err(|_| KtlsError::BadKeyMaterial("aes-256-gcm key"))?;
                let nonce: [u8; 12] = iv
                    .as_ref()
                    .try_into()
                    .map_err(|_| KtlsError::BadKeyMaterial("aes-256-gcm iv"))?;
                let mut salt = [0u8; 4];
                let mut iv8 = [0u8; 8];
                salt.copy_from_slice(&nonce[..4]);
                iv8.copy_from_slice(&nonce[4..]);
                Ok(Self::AesGcm256 { iv: iv8, key, salt, rec_seq })
            }
            ConnectionTrafficSecrets::Chacha20Poly1305 { key, iv } => {
                let key: [u8; 32] = key
                    .as_ref()
                    .try_into()
                    .map_err(|_| KtlsError::BadKeyMaterial("chacha20 key"))?;
                let iv: [u8; 12] = iv
                    .as_ref()
                    .try_into()
                    .map_err(|_| KtlsError::BadKeyMaterial("chacha20 iv"))?;
                Ok(Self::Chacha20Poly1305 { iv, key, rec_seq })
            }
            _ => Err(KtlsError::UnsupportedCipher("unknown traffic secret kind")),
        }
    }

    /// Serialize in kernel `crypto_info` layout for the given version.
    #[must_use]
    pub fn wire_bytes(&self, version: KtlsVersion) -> Vec<u8> {
        let mut out = Vec::with_capacity(56);
        out.extend_from_slice(&version.wire().to_ne_bytes());
        out.extend_from_slice(&self.cipher_type().to_ne_bytes());
        match self {
            Self::AesGcm128 { iv, key, salt, rec_seq }
            | Self::AesCcm128 { iv, key, salt, rec_seq } => {
                out.extend_from_slice(iv);
                out.extend_from_slice(key);
                out.extend_from_slice(salt);
                out.extend_from_slice(rec_seq);
            }
            Self::AesGcm256 { iv, key, salt, rec_seq } => {
                out.extend_from_slice(iv);
                out.extend_from_slice(key);
                out.extend_from_slice(salt);
                out.extend_from_slice(rec_seq);
            }
            Self::Chacha20Poly1305 { iv, key, rec_seq } => {
                out.extend_from_slice(iv);
                out.extend_from_slice(key);
                out.extend_from_slice(rec_seq);
            }
        }
        out
    }
}

fn setsockopt_raw(fd: RawFd, level: libc::c_int, opt: libc::c_int, val: &[u8]) -> io::Result<()> {
    // SAFETY: val points at `val.len()` initialized bytes for the call.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            val.as_ptr().cast(),
            val.len() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Install kernel TLS for both directions, consuming the user-space
/// session. Crypto-info for TX and RX is built and validated first; no
/// socket option is set unless both directions are offloadable.
pub fn offload(fd: RawFd, conn: ClientConnection) -> Result<(), KtlsError> {
    let version = KtlsVersion::from_protocol(
        conn.protocol_version()
            .ok_or(KtlsError::UnsupportedVersion(ProtocolVersion::Unknown(0)))?,
    )?;
    let secrets = conn.dangerous_extract_secrets()?;
    let (tx_seq, tx_secrets) = secrets.tx;
    let (rx_seq, rx_secrets) = secrets.rx;
    let tx = KtlsCryptoInfo::from_secrets(tx_seq, &tx_secrets)?;
    let rx = KtlsCryptoInfo::from_secrets(rx_seq, &rx_secrets)?;

    setsockopt_raw(fd, SOL_TCP, TCP_ULP, b"tls")?;
    setsockopt_raw(fd, SOL_TLS, TLS_TX, &tx.wire_bytes(version))?;
    setsockopt_raw(fd, SOL_TLS, TLS_RX, &rx.wire_bytes(version))?;
    info!(fd, cipher = tx.cipher_name(), "kernel TLS offload installed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gcm128() -> KtlsCryptoInfo {
        KtlsCryptoInfo::AesGcm128 {
            iv: [1; 8],
            key: [2; 16],
            salt: [3; 4],
            rec_seq: [4; 8],
        }
    }

    #[test]
    fn layout_sizes_match_kernel_structs() {
        assert_eq!(gcm128().wire_bytes(KtlsVersion::V1_3).len(), 40);
        let ccm = KtlsCryptoInfo::AesCcm128 {
            iv: [0; 8],
            key: [0; 16],
            salt: [0; 4],
            rec_seq: [0; 8],
        };
        assert_eq!(ccm.wire_bytes(KtlsVersion::V1_2).len(), 40);
        let gcm256 = KtlsCryptoInfo::AesGcm256 {
            iv: [0; 8],
            key: [0; 32],
            salt: [0; 4],
            rec_seq: [0; 8],
        };
        assert_eq!(gcm256.wire_bytes(KtlsVersion::V1_3).len(), 56);
        let chacha = KtlsCryptoInfo::Chacha20Poly1305 {
            iv: [0; 12],
            key: [0; 32],
            rec_seq: [0; 8],
        };
        assert_eq!(chacha.wire_bytes(KtlsVersion::V1_3).len(), 56);
    }

    #[test]
    fn field_order_is_header_iv_key_salt_seq() {
        let w = gcm128().wire_bytes(KtlsVersion::V1_3);
        assert_eq!(w[0..2], 0x0304u16.to_ne_bytes());
        assert_eq!(w[2..4], 51u16.to_ne_bytes());
        assert_eq!(&w[4..12], &[1; 8]); // iv
        assert_eq!(&w[12..28], &[2; 16]); // key
        assert_eq!(&w[28..32], &[3; 4]); // salt
        assert_eq!(&w[32..40], &[4; 8]); // rec_seq
    }

    #[test]
    fn cipher_codes() {
        assert_eq!(gcm128().cipher_type(), 51);
        let chacha = KtlsCryptoInfo::Chacha20Poly1305 {
            iv: [0; 12],
            key: [0; 32],
            rec_seq: [0; 8],
        };
        assert_eq!(chacha.cipher_type(), 54);
    }

    #[test]
    fn version_mapping_rejects_legacy() {
        assert!(KtlsVersion::from_protocol(ProtocolVersion::TLSv1_2).is_ok());
        assert!(KtlsVersion::from_protocol(ProtocolVersion::TLSv1_3).is_ok());
        assert!(matches!(
            KtlsVersion::from_protocol(ProtocolVersion::TLSv1_1),
            Err(KtlsError::UnsupportedVersion(_))
        ));
    }
}
