//! Native transaction signer.
//!
//! Protobuf encoding of Cosmos transactions and ethsecp256k1 signing live in a
//! native signer library loaded at runtime. The library exposes two C entry
//! points:
//! - `DeriveAddress(key) -> {str, err}` returning the bech32 `inj1...` address;
//! - `SignTx(key, chain_id, account_number, sequence, gas_price, gas_limit,
//!   fee_denom, msgs_json) -> {str, err}` returning base64 encoded tx bytes.

use std::{
    env,
    ffi::{c_char, c_ulonglong, CStr, CString},
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use alloy_signer_local::PrivateKeySigner;
use libloading::{Library, Symbol};

use crate::{
    errors::{BotError, Result},
    types::{AccountNumber, Sequence},
};

#[repr(C)]
#[derive(Debug, Copy, Clone)]
struct RawStrOrErr {
    #[allow(non_snake_case)]
    str_: *const c_char,
    err: *const c_char,
}

type DeriveAddressFn = unsafe extern "C" fn(*const c_char) -> RawStrOrErr;
type SignTxFn = unsafe extern "C" fn(
    *const c_char,
    *const c_char,
    c_ulonglong,
    c_ulonglong,
    *const c_char,
    c_ulonglong,
    *const c_char,
    *const c_char,
) -> RawStrOrErr;

/// Hex private key held in memory for the lifetime of a wallet session.
#[derive(Clone)]
pub struct SigningKey(String);

impl SigningKey {
    pub fn new(value: impl AsRef<str>) -> Self {
        Self(sanitize_private_key(value.as_ref()))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Ethereum-style `0x` address of the key, used in log lines.
    pub fn eth_address(&self) -> Result<String> {
        let signer = PrivateKeySigner::from_str(&self.0)
            .map_err(|err| BotError::Signer(format!("invalid private key: {err}")))?;
        Ok(signer.address().to_string())
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningKey(<redacted>)")
    }
}

/// Everything needed to produce one signed transaction.
#[derive(Debug, Clone)]
pub struct SignRequest<'a> {
    pub chain_id: &'a str,
    pub account_number: AccountNumber,
    pub sequence: Sequence,
    pub gas_price: f64,
    pub gas_limit: u64,
    pub fee_denom: &'a str,
    pub messages: &'a serde_json::Value,
}

pub trait TxSigner: Send + Sync {
    fn derive_address(&self, key: &SigningKey) -> Result<String>;
    fn sign(&self, key: &SigningKey, request: &SignRequest<'_>) -> Result<String>;
}

pub struct SignerLibrary {
    #[allow(dead_code)]
    lib: Library,
    derive_address: DeriveAddressFn,
    sign_tx: SignTxFn,
}

impl SignerLibrary {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => Self::load_default(),
        }
    }

    pub fn load_default() -> Result<Self> {
        if let Ok(path) = env::var("INJ_SIGNER_PATH") {
            return Self::load_from_path(Path::new(&path));
        }

        let filename = Self::library_filename()?;
        let mut candidates: Vec<PathBuf> = vec![];

        if let Ok(current_dir) = env::current_dir() {
            candidates.push(current_dir.join("signers").join(&filename));
            candidates.push(current_dir.join(&filename));
        }

        if let Ok(exe_path) = env::current_exe() {
            if let Some(dir) = exe_path.parent() {
                candidates.push(dir.join("signers").join(&filename));
                candidates.push(dir.join(&filename));
            }
        }

        for candidate in candidates {
            if candidate.exists() {
                return Self::load_from_path(&candidate);
            }
        }

        Err(BotError::Signer(format!(
            "unable to locate signer library (expected {filename})"
        )))
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        // SAFETY: `path` points to the signer dynamic library discovered on disk. The library
        // remains loaded for the lifetime of `SignerLibrary`, so the resulting handle is valid.
        let lib = unsafe { Library::new(path) }?;

        macro_rules! load_fn {
            ($sym:expr, $ty:ty) => {{
                // SAFETY: Symbols are resolved from the freshly loaded signer library using the
                // exported names. The library outlives the returned function pointers.
                let symbol: Symbol<$ty> = unsafe { lib.get($sym)? };
                *symbol
            }};
        }

        let derive_address = load_fn!(b"DeriveAddress\0", DeriveAddressFn);
        let sign_tx = load_fn!(b"SignTx\0", SignTxFn);

        Ok(SignerLibrary {
            lib,
            derive_address,
            sign_tx,
        })
    }

    fn library_filename() -> Result<String> {
        let os = env::consts::OS;
        let arch = env::consts::ARCH;

        match (os, arch) {
            ("linux", "x86_64") => Ok("injsigner-amd64.so".to_string()),
            ("linux", "aarch64") => Ok("injsigner-arm64.so".to_string()),
            ("macos", "aarch64") => Ok("injsigner-arm64.dylib".to_string()),
            _ => Err(BotError::UnsupportedPlatform(format!("{os}/{arch}"))),
        }
    }
}

impl TxSigner for SignerLibrary {
    fn derive_address(&self, key: &SigningKey) -> Result<String> {
        let key_c = CString::new(key.expose())?;
        // SAFETY: `key_c` is a valid NUL-terminated string that lives for the duration of the call.
        let raw = unsafe { (self.derive_address)(key_c.as_ptr()) };
        let (value, err) = str_or_err(raw)?;
        parse_sign_output(value, err, "derive_address")
    }

    fn sign(&self, key: &SigningKey, request: &SignRequest<'_>) -> Result<String> {
        let key_c = CString::new(key.expose())?;
        let chain_c = CString::new(request.chain_id)?;
        let gas_price_c = CString::new(format!("{:.0}", request.gas_price))?;
        let denom_c = CString::new(request.fee_denom)?;
        let msgs_c = CString::new(serde_json::to_string(request.messages)?)?;
        // SAFETY: every pointer comes from a `CString` owned by this frame and numeric arguments
        // are copied by value.
        let raw = unsafe {
            (self.sign_tx)(
                key_c.as_ptr(),
                chain_c.as_ptr(),
                request.account_number.into_inner(),
                request.sequence.into_inner(),
                gas_price_c.as_ptr(),
                request.gas_limit,
                denom_c.as_ptr(),
                msgs_c.as_ptr(),
            )
        };
        let (value, err) = str_or_err(raw)?;
        parse_sign_output(value, err, "sign_tx")
    }
}

fn to_optional_string(ptr: *const c_char) -> Result<Option<String>> {
    if ptr.is_null() {
        return Ok(None);
    }
    // SAFETY: The signer library guarantees returned pointers are valid UTF-8 C strings or null.
    let s = unsafe { CStr::from_ptr(ptr) };
    Ok(Some(s.to_str()?.to_string()))
}

fn str_or_err(raw: RawStrOrErr) -> Result<(Option<String>, Option<String>)> {
    let string = to_optional_string(raw.str_)?;
    let err = to_optional_string(raw.err)?;
    Ok((string, err))
}

fn parse_sign_output(value: Option<String>, error: Option<String>, context: &str) -> Result<String> {
    if let Some(err) = error.filter(|err| !err.is_empty()) {
        return Err(BotError::Signer(format!("{context}: {err}")));
    }
    value.ok_or_else(|| BotError::InvalidResponse(format!("{context}: empty signer output")))
}

fn sanitize_private_key(value: &str) -> String {
    value.trim().trim_start_matches("0x").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_private_key() {
        assert_eq!(sanitize_private_key("0xabc"), "abc");
        assert_eq!(sanitize_private_key(" abc\n"), "abc");
    }

    #[test]
    fn test_signing_key_debug_is_redacted() {
        let key = SigningKey::new("0xdeadbeef");
        assert_eq!(key.expose(), "deadbeef");
        assert!(!format!("{key:?}").contains("dead"));
    }

    #[test]
    fn test_eth_address_from_key() {
        let key =
            SigningKey::new("0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318");
        let address = key.eth_address().unwrap();
        assert!(address.starts_with("0x"));
        assert_eq!(address.len(), 42);
        assert!(SigningKey::new("not-a-key").eth_address().is_err());
    }

    #[test]
    fn test_parse_sign_output() {
        assert_eq!(
            parse_sign_output(Some("tx".into()), None, "ctx").unwrap(),
            "tx"
        );
        assert_eq!(
            parse_sign_output(Some("tx".into()), Some(String::new()), "ctx").unwrap(),
            "tx"
        );
        assert!(parse_sign_output(None, Some("boom".into()), "ctx").is_err());
        assert!(parse_sign_output(None, None, "ctx").is_err());
    }
}
