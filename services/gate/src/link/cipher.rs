//! 链接载荷对称加解密（AES-256-CBC + PKCS#7，每次随机 IV）。

use aes::Aes256;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use rand::{RngCore, rngs::OsRng};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// IV 字节长度。
pub(crate) const IV_LEN: usize = 16;
/// 密钥字节长度。
pub(crate) const KEY_LEN: usize = 32;

/// 一次加密的产物，字段均为小写十六进制。
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CipherPayload {
    pub(crate) iv: String,
    pub(crate) ciphertext: String,
}

/// 解密失败：调用方一律按“格式错误或非本服务签发的链接”处理。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DecryptionError {
    IvFormat,
    CiphertextFormat,
    Padding,
    Utf8,
}

/// 服务级对称加密器，密钥启动后不可变。
#[derive(Clone)]
pub(crate) struct LinkCipher {
    key: [u8; KEY_LEN],
}

impl LinkCipher {
    pub(crate) fn new(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    /// 加密明文，IV 每次从系统随机源重新生成。
    pub(crate) fn encrypt(&self, plaintext: &str) -> CipherPayload {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);
        let ciphertext = Aes256CbcEnc::new(&self.key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
        CipherPayload {
            iv: hex::encode(iv),
            ciphertext: hex::encode(ciphertext),
        }
    }

    /// 解密十六进制密文。
    pub(crate) fn decrypt(
        &self,
        ciphertext_hex: &str,
        iv_hex: &str,
    ) -> Result<String, DecryptionError> {
        let iv_raw = hex::decode(iv_hex.trim()).map_err(|_| DecryptionError::IvFormat)?;
        let iv: [u8; IV_LEN] = iv_raw.try_into().map_err(|_| DecryptionError::IvFormat)?;
        let ciphertext =
            hex::decode(ciphertext_hex.trim()).map_err(|_| DecryptionError::CiphertextFormat)?;
        if ciphertext.is_empty() || ciphertext.len() % IV_LEN != 0 {
            return Err(DecryptionError::CiphertextFormat);
        }

        let plaintext = Aes256CbcDec::new(&self.key.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|_| DecryptionError::Padding)?;
        String::from_utf8(plaintext).map_err(|_| DecryptionError::Utf8)
    }
}

/// 解析 64 位十六进制密钥。
pub(crate) fn parse_key_hex(raw: &str) -> Result<[u8; KEY_LEN], String> {
    let bytes = hex::decode(raw.trim()).map_err(|err| format!("cipher key is not hex: {err}"))?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| format!("cipher key must be {KEY_LEN} bytes, got {len}"))
}
