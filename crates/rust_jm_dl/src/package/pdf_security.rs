//! Password protection for generated PDFs.
//!
//! Implements the standard security handler, revision 6 (AES-256), just far
//! enough to write documents: a random file key encrypts every stream with
//! AES-256-CBC, and the `/Encrypt` dictionary stores that key wrapped with
//! keys derived from the password.

use crate::errors::{JmError, Result};

use aes::cipher::{
    BlockEncryptMut, KeyInit, KeyIvInit,
    block_padding::{NoPadding, Pkcs7},
};
use aes::{Aes128, Aes256};
use lopdf::{Dictionary, Object, StringFormat};
use sha2::{Digest, Sha256, Sha384, Sha512};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256EcbEnc = ecb::Encryptor<Aes256>;

/// Printing allowed; modifying, copying and annotating aren't.
pub const PERMISSIONS: i32 = -3900;

/// Passwords are capped at 127 bytes.
const MAX_PASSWORD_LEN: usize = 127;

fn pdf_err(what: &str) -> JmError {
    JmError::Pdf(format!("encryption failed: {what}"))
}

fn truncated(password: &str) -> &[u8] {
    let bytes = password.as_bytes();
    &bytes[..bytes.len().min(MAX_PASSWORD_LEN)]
}

/// The revision 6 password hash (ISO 32000-2, algorithm 2.B).
///
/// `udata` is empty for user keys and the 48-byte `/U` for owner keys.
pub(crate) fn hash_r6(password: &[u8], salt: &[u8], udata: &[u8]) -> Result<[u8; 32]> {
    let mut k: Vec<u8> = Sha256::new()
        .chain_update(password)
        .chain_update(salt)
        .chain_update(udata)
        .finalize()
        .to_vec();

    let mut round: u32 = 0;
    let mut last: u8 = 0;

    while round < 64 || u32::from(last) > round - 32 {
        let mut block = Vec::with_capacity(password.len() + k.len() + udata.len());
        block.extend_from_slice(password);
        block.extend_from_slice(&k);
        block.extend_from_slice(udata);

        let mut k1 = block.repeat(64);
        let len = k1.len();

        let cipher =
            Aes128CbcEnc::new_from_slices(&k[..16], &k[16..32]).map_err(|_| pdf_err("hash key"))?;
        let e = cipher
            .encrypt_padded_mut::<NoPadding>(&mut k1, len)
            .map_err(|_| pdf_err("hash block"))?;

        // the first 16 bytes as a big-endian number, mod 3
        let selector = e[..16].iter().map(|&b| u32::from(b)).sum::<u32>() % 3;

        k = match selector {
            0 => Sha256::digest(&*e).to_vec(),
            1 => Sha384::digest(&*e).to_vec(),
            _ => Sha512::digest(&*e).to_vec(),
        };

        last = e[e.len() - 1];
        round += 1;
    }

    let mut out = [0u8; 32];
    out.copy_from_slice(&k[..32]);
    Ok(out)
}

/// AES-256-CBC with a zero iv and no padding, used to wrap the file key.
fn wrap_key(key: &[u8; 32], file_key: &[u8; 32]) -> Result<Vec<u8>> {
    let mut buf = file_key.to_vec();
    let cipher = Aes256CbcEnc::new_from_slices(key, &[0u8; 16]).map_err(|_| pdf_err("wrap key"))?;
    let out = cipher
        .encrypt_padded_mut::<NoPadding>(&mut buf, 32)
        .map_err(|_| pdf_err("wrap"))?;

    Ok(out.to_vec())
}

/// Holds the file key of one document and writes its `/Encrypt` dictionary.
pub struct SecurityHandler {
    file_key: [u8; 32],
    u: Vec<u8>,
    ue: Vec<u8>,
    o: Vec<u8>,
    oe: Vec<u8>,
    perms: Vec<u8>,
}

impl SecurityHandler {
    pub fn new(user_password: &str, owner_password: &str) -> Result<Self> {
        let file_key: [u8; 32] = rand::random();
        Self::with_key(user_password, owner_password, file_key)
    }

    fn with_key(user_password: &str, owner_password: &str, file_key: [u8; 32]) -> Result<Self> {
        let user = truncated(user_password);
        let owner = truncated(owner_password);

        // validation salt ++ key salt
        let user_salts: [u8; 16] = rand::random();
        let owner_salts: [u8; 16] = rand::random();

        let mut u = hash_r6(user, &user_salts[..8], &[])?.to_vec();
        u.extend_from_slice(&user_salts);
        let ue = wrap_key(&hash_r6(user, &user_salts[8..], &[])?, &file_key)?;

        let mut o = hash_r6(owner, &owner_salts[..8], &u)?.to_vec();
        o.extend_from_slice(&owner_salts);
        let oe = wrap_key(&hash_r6(owner, &owner_salts[8..], &u)?, &file_key)?;

        let mut perms = [0u8; 16];
        perms[..4].copy_from_slice(&PERMISSIONS.to_le_bytes());
        perms[4..8].copy_from_slice(&[0xff; 4]);
        perms[8..12].copy_from_slice(b"Tadb");
        perms[12..].copy_from_slice(&rand::random::<[u8; 4]>());

        let cipher = Aes256EcbEnc::new_from_slice(&file_key).map_err(|_| pdf_err("perms key"))?;
        let perms = cipher
            .encrypt_padded_mut::<NoPadding>(&mut perms, 16)
            .map_err(|_| pdf_err("perms"))?
            .to_vec();

        Ok(Self {
            file_key,
            u,
            ue,
            o,
            oe,
            perms,
        })
    }

    /// The `/Encrypt` dictionary to reference from the trailer.
    pub fn encrypt_dictionary(&self) -> Dictionary {
        let hex = |b: &[u8]| Object::String(b.to_vec(), StringFormat::Hexadecimal);

        let mut std_cf = Dictionary::new();
        std_cf.set("AuthEvent", Object::Name(b"DocOpen".to_vec()));
        std_cf.set("CFM", Object::Name(b"AESV3".to_vec()));
        std_cf.set("Length", Object::Integer(32));

        let mut cf = Dictionary::new();
        cf.set("StdCF", Object::Dictionary(std_cf));

        let mut dict = Dictionary::new();
        dict.set("Filter", Object::Name(b"Standard".to_vec()));
        dict.set("V", Object::Integer(5));
        dict.set("R", Object::Integer(6));
        dict.set("Length", Object::Integer(256));
        dict.set("CF", Object::Dictionary(cf));
        dict.set("StmF", Object::Name(b"StdCF".to_vec()));
        dict.set("StrF", Object::Name(b"StdCF".to_vec()));
        dict.set("O", hex(&self.o));
        dict.set("U", hex(&self.u));
        dict.set("OE", hex(&self.oe));
        dict.set("UE", hex(&self.ue));
        dict.set("P", Object::Integer(i64::from(PERMISSIONS)));
        dict.set("Perms", hex(&self.perms));
        dict.set("EncryptMetadata", Object::Boolean(true));

        dict
    }

    /// Encrypts stream data: a random iv followed by the padded ciphertext.
    pub fn encrypt_stream(&self, data: &[u8]) -> Result<Vec<u8>> {
        let iv: [u8; 16] = rand::random();
        let cipher =
            Aes256CbcEnc::new_from_slices(&self.file_key, &iv).map_err(|_| pdf_err("stream key"))?;

        let mut buf = vec![0u8; data.len() + 16];
        buf[..data.len()].copy_from_slice(data);
        let ciphertext = cipher
            .encrypt_padded_mut::<Pkcs7>(&mut buf, data.len())
            .map_err(|_| pdf_err("stream"))?;

        let mut out = Vec::with_capacity(16 + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(ciphertext);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use aes::cipher::BlockDecryptMut;

    type Aes256CbcDec = cbc::Decryptor<Aes256>;
    type Aes256EcbDec = ecb::Decryptor<Aes256>;

    const KEY: [u8; 32] = [7u8; 32];

    #[test]
    fn user_password_validates_and_unwraps_key() {
        let h = SecurityHandler::with_key("hunter2", "hunter2", KEY).unwrap();
        assert_eq!(h.u.len(), 48);
        assert_eq!(h.ue.len(), 32);

        // what a reader does with the user password
        let hash = hash_r6(b"hunter2", &h.u[32..40], &[]).unwrap();
        assert_eq!(&hash[..], &h.u[..32]);
        assert_ne!(&hash_r6(b"wrong", &h.u[32..40], &[]).unwrap()[..], &h.u[..32]);

        let key = hash_r6(b"hunter2", &h.u[40..48], &[]).unwrap();
        let mut ue = h.ue.clone();
        let file_key = Aes256CbcDec::new_from_slices(&key, &[0u8; 16])
            .unwrap()
            .decrypt_padded_mut::<NoPadding>(&mut ue)
            .unwrap();
        assert_eq!(file_key, &KEY[..]);
    }

    #[test]
    fn owner_password_unwraps_key() {
        let h = SecurityHandler::with_key("user", "owner", KEY).unwrap();

        let hash = hash_r6(b"owner", &h.o[32..40], &h.u).unwrap();
        assert_eq!(&hash[..], &h.o[..32]);

        let key = hash_r6(b"owner", &h.o[40..48], &h.u).unwrap();
        let mut oe = h.oe.clone();
        let file_key = Aes256CbcDec::new_from_slices(&key, &[0u8; 16])
            .unwrap()
            .decrypt_padded_mut::<NoPadding>(&mut oe)
            .unwrap();
        assert_eq!(file_key, &KEY[..]);
    }

    #[test]
    fn perms_round_trip() {
        let h = SecurityHandler::with_key("a", "a", KEY).unwrap();
        let mut perms = h.perms.clone();
        let plain = Aes256EcbDec::new_from_slice(&KEY)
            .unwrap()
            .decrypt_padded_mut::<NoPadding>(&mut perms)
            .unwrap();

        assert_eq!(i32::from_le_bytes(plain[..4].try_into().unwrap()), PERMISSIONS);
        assert_eq!(&plain[8..12], b"Tadb");
    }

    #[test]
    fn streams_decrypt_with_file_key() {
        let h = SecurityHandler::with_key("a", "a", KEY).unwrap();
        let data = b"q 10 0 0 20 0 0 cm /Im0 Do Q".to_vec();
        let encrypted = h.encrypt_stream(&data).unwrap();

        assert_eq!(encrypted.len(), 16 + 32);

        let (iv, body) = encrypted.split_at(16);
        let mut body = body.to_vec();
        let plain = Aes256CbcDec::new_from_slices(&KEY, iv)
            .unwrap()
            .decrypt_padded_mut::<Pkcs7>(&mut body)
            .unwrap();
        assert_eq!(plain, &data[..]);
    }

    #[test]
    fn long_passwords_are_truncated() {
        let long = "x".repeat(200);
        assert_eq!(truncated(&long).len(), 127);
    }
}
