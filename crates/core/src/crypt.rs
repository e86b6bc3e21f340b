//! Standard security handler for RC4-encrypted files.
//!
//! Covers the published revisions of the standard handler (V 1 and 2,
//! R 2 and 3). A [`CryptState`] comes up locked; a successful
//! [`CryptState::authenticate`] derives the file key from the password and
//! the `/O`, `/U`, `/P` and `/ID` values, after which
//! [`CryptState::decrypt_all`] rewrites every string and stream in the
//! store once. From then on the document behaves like a plain one.

use bytes::Bytes;
use rustc_hash::FxHashSet;
use tracing::debug;

use crate::error::{Error, Result};
use crate::object::{GraphNode, NodeId, ObjectStore, XrefSlot};

/// Padding applied to every password before key derivation.
const PASSWORD_PADDING: [u8; 32] = [
    0x28, 0xBF, 0x4E, 0x5E, 0x4E, 0x75, 0x8A, 0x41, 0x64, 0x00, 0x4E, 0x56, 0xFF, 0xFA, 0x01,
    0x08, 0x2E, 0x2E, 0x00, 0xB6, 0xD0, 0x68, 0x3E, 0x80, 0x2F, 0x0C, 0xA9, 0xFE, 0x64, 0x53,
    0x69, 0x7A,
];

/// Which password a successful authentication matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PasswordKind {
    User,
    Owner,
}

/// Encryption state for one document: the parsed `/Encrypt` parameters,
/// the object number of the encrypt dictionary itself (stored in the
/// clear), and the file key once a password has worked.
pub(crate) struct CryptState {
    version: i64,
    revision: i64,
    /// File key length in bytes, 5 to 16.
    key_len: usize,
    owner_hash: Vec<u8>,
    user_hash: Vec<u8>,
    permissions: i64,
    file_id: Vec<u8>,
    encrypt_num: Option<u32>,
    key: Option<Vec<u8>>,
}

impl CryptState {
    /// Reads the trailer's `/Encrypt` entry. `Ok(None)` means the document
    /// is not encrypted; handlers other than the RC4 flavors of the
    /// standard one are rejected at open rather than at first use.
    pub(crate) fn from_store(s: &ObjectStore) -> Result<Option<CryptState>> {
        let enc_ref = s.dict_get(s.trailer, "Encrypt");
        if enc_ref == NodeId::NULL {
            return Ok(None);
        }
        let encrypt_num = match s.node(enc_ref) {
            GraphNode::Ref(num, _) => Some(*num),
            _ => None,
        };
        let enc = s.resolve(enc_ref);
        if !matches!(s.node(enc), GraphNode::Dict(_)) {
            return Err(Error::Corrupt("encrypt entry is not a dictionary".into()));
        }
        match s
            .name_value(s.dict_get_resolved(enc, "Filter"))
            .map(|n| n.as_str())
        {
            Some("Standard") => {}
            Some(other) => {
                return Err(Error::UnsupportedEncryption(format!(
                    "security handler {other}"
                )));
            }
            None => {
                return Err(Error::Corrupt("encrypt dictionary has no filter".into()));
            }
        }
        let version = s.int_value(s.dict_get_resolved(enc, "V")).unwrap_or(0);
        if !(1..=2).contains(&version) {
            return Err(Error::UnsupportedEncryption(format!("V={version}")));
        }
        let revision = s.int_value(s.dict_get_resolved(enc, "R")).unwrap_or(0);
        if !(2..=3).contains(&revision) {
            return Err(Error::UnsupportedEncryption(format!("R={revision}")));
        }
        let length = s
            .int_value(s.dict_get_resolved(enc, "Length"))
            .unwrap_or(40);
        // R2 is always 40-bit regardless of a stated length.
        let key_len = if revision == 2 {
            5
        } else {
            (length / 8).clamp(5, 16) as usize
        };
        let owner_hash = s
            .string_value(s.dict_get_resolved(enc, "O"))
            .ok_or_else(|| Error::Corrupt("encrypt dictionary has no O value".into()))?
            .to_vec();
        let user_hash = s
            .string_value(s.dict_get_resolved(enc, "U"))
            .ok_or_else(|| Error::Corrupt("encrypt dictionary has no U value".into()))?
            .to_vec();
        let permissions = s.int_value(s.dict_get_resolved(enc, "P")).unwrap_or(-1);
        let id_node = s.dict_get_resolved(s.trailer, "ID");
        let file_id = match s.node(id_node) {
            GraphNode::Array(items) if !items.is_empty() => {
                s.string_value(items[0]).unwrap_or_default().to_vec()
            }
            _ => Vec::new(),
        };
        debug!(
            version,
            revision,
            key_bits = key_len * 8,
            "standard security handler"
        );
        Ok(Some(CryptState {
            version,
            revision,
            key_len,
            owner_hash,
            user_hash,
            permissions,
            file_id,
            encrypt_num,
            key: None,
        }))
    }

    /// Tries `password` first as the user password, then as the owner
    /// password. Success stores the file key for decryption.
    pub(crate) fn authenticate(&mut self, password: &[u8]) -> Option<PasswordKind> {
        let key = self.file_key(password);
        if self.key_matches(&key) {
            self.key = Some(key);
            return Some(PasswordKind::User);
        }
        let as_user = self.owner_to_user(password);
        let key = self.file_key(&as_user);
        if self.key_matches(&key) {
            self.key = Some(key);
            return Some(PasswordKind::Owner);
        }
        None
    }

    /// The `/P` permission flags as stored.
    pub(crate) fn permissions(&self) -> i64 {
        self.permissions
    }

    pub(crate) fn describe(&self) -> String {
        format!(
            "Standard V{} R{} {}-bit RC4",
            self.version,
            self.revision,
            self.key_len * 8
        )
    }

    /// Rewrites every string and stream in place with its per-object key.
    /// `skip` lists objects stored in the clear, which is the encrypt
    /// dictionary itself plus any cross-reference streams.
    pub(crate) fn decrypt_all(
        &self,
        s: &mut ObjectStore,
        skip: &FxHashSet<u32>,
    ) -> Result<()> {
        let Some(file_key) = self.key.as_ref() else {
            return Err(Error::NeedsPassword);
        };
        let mut objects: Vec<(u32, NodeId, u16)> = s
            .xref
            .iter()
            .filter_map(|(&num, &slot)| match slot {
                XrefSlot::Loaded { node, gen } => Some((num, node, gen)),
                _ => None,
            })
            .collect();
        objects.sort_unstable_by_key(|e| e.0);
        let mut seen: FxHashSet<NodeId> = FxHashSet::default();
        for (num, node, gen) in objects {
            if skip.contains(&num) || self.encrypt_num == Some(num) {
                continue;
            }
            let key = self.object_key(file_key, num, gen);
            decrypt_subtree(s, node, &key, &mut seen);
        }
        debug!("decrypted document in place");
        Ok(())
    }

    /// Algorithm 3.2: file key from a padded password and the encrypt
    /// dictionary values.
    fn file_key(&self, password: &[u8]) -> Vec<u8> {
        let mut ctx = md5::Context::new();
        ctx.consume(pad_password(password));
        ctx.consume(&self.owner_hash);
        ctx.consume((self.permissions as u32).to_le_bytes());
        ctx.consume(&self.file_id);
        let mut digest = ctx.finalize().0.to_vec();
        if self.revision >= 3 {
            // Fifty rounds over the truncated key.
            for _ in 0..50 {
                digest = md5::compute(&digest[..self.key_len]).0.to_vec();
            }
        }
        digest.truncate(self.key_len);
        digest
    }

    /// Algorithms 3.4 and 3.5: the `/U` check value a given key produces.
    /// 32 bytes for R2, 16 for R3.
    fn user_check_value(&self, key: &[u8]) -> Vec<u8> {
        if self.revision == 2 {
            Rc4::new(key).apply(&PASSWORD_PADDING)
        } else {
            let mut ctx = md5::Context::new();
            ctx.consume(PASSWORD_PADDING);
            ctx.consume(&self.file_id);
            let mut value = Rc4::new(key).apply(&ctx.finalize().0);
            for round in 1..20u8 {
                let salted: Vec<u8> = key.iter().map(|b| b ^ round).collect();
                value = Rc4::new(&salted).apply(&value);
            }
            value
        }
    }

    /// Algorithm 3.6: R2 compares the whole value, R3 the first 16 bytes.
    fn key_matches(&self, key: &[u8]) -> bool {
        let computed = self.user_check_value(key);
        if self.revision == 2 {
            computed == self.user_hash
        } else {
            match (computed.get(..16), self.user_hash.get(..16)) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            }
        }
    }

    /// Algorithm 3.7: decrypting `/O` with the owner-derived key yields the
    /// padded user password, which then authenticates normally.
    fn owner_to_user(&self, password: &[u8]) -> Vec<u8> {
        let mut digest = md5::compute(pad_password(password)).0.to_vec();
        if self.revision >= 3 {
            for _ in 0..50 {
                digest = md5::compute(&digest).0.to_vec();
            }
        }
        let key = &digest[..self.key_len];
        if self.revision == 2 {
            Rc4::new(key).apply(&self.owner_hash)
        } else {
            let mut value = self.owner_hash.clone();
            for round in (0..20u8).rev() {
                let salted: Vec<u8> = key.iter().map(|b| b ^ round).collect();
                value = Rc4::new(&salted).apply(&value);
            }
            value
        }
    }

    /// Per-object key: md5 of the file key, the low three bytes of the
    /// object number and the two generation bytes, truncated to
    /// min(length + 5, 16).
    fn object_key(&self, file_key: &[u8], num: u32, gen: u16) -> Vec<u8> {
        let mut ctx = md5::Context::new();
        ctx.consume(file_key);
        ctx.consume(&num.to_le_bytes()[..3]);
        ctx.consume(gen.to_le_bytes());
        let digest = ctx.finalize().0;
        digest[..(file_key.len() + 5).min(16)].to_vec()
    }
}

fn pad_password(password: &[u8]) -> [u8; 32] {
    let mut padded = [0u8; 32];
    let n = password.len().min(32);
    padded[..n].copy_from_slice(&password[..n]);
    padded[n..].copy_from_slice(&PASSWORD_PADDING[..32 - n]);
    padded
}

/// Depth-first rewrite of one object's direct subtree. References are not
/// followed; their targets are objects with keys of their own.
fn decrypt_subtree(
    s: &mut ObjectStore,
    root: NodeId,
    key: &[u8],
    seen: &mut FxHashSet<NodeId>,
) {
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        if id == NodeId::NULL || !seen.insert(id) {
            continue;
        }
        let Some(node) = s.node_mut(id) else {
            continue;
        };
        match node {
            GraphNode::String(bytes) => {
                let plain = Rc4::new(key).apply(bytes);
                *bytes = plain;
            }
            GraphNode::Stream { dict, raw } => {
                stack.push(*dict);
                let plain = Rc4::new(key).apply(raw);
                *raw = Bytes::from(plain);
            }
            GraphNode::Array(items) => stack.extend(items.iter().copied()),
            GraphNode::Dict(map) => stack.extend(map.values().copied()),
            _ => {}
        }
    }
}

/// RC4 state machine. Keys are 1 to 256 bytes; every key this module
/// derives is between 5 and 16.
struct Rc4 {
    state: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    fn new(key: &[u8]) -> Rc4 {
        let mut state: [u8; 256] = std::array::from_fn(|i| i as u8);
        let mut j: u8 = 0;
        for i in 0..256 {
            j = j.wrapping_add(state[i]).wrapping_add(key[i % key.len()]);
            state.swap(i, j as usize);
        }
        Rc4 { state, i: 0, j: 0 }
    }

    fn apply(&mut self, data: &[u8]) -> Vec<u8> {
        data.iter().map(|b| b ^ self.keystream()).collect()
    }

    fn keystream(&mut self) -> u8 {
        self.i = self.i.wrapping_add(1);
        self.j = self.j.wrapping_add(self.state[self.i as usize]);
        self.state.swap(self.i as usize, self.j as usize);
        let k = self.state[self.i as usize].wrapping_add(self.state[self.j as usize]);
        self.state[k as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    use crate::document::{AuthOutcome, Document};
    use crate::engine::Engine;

    fn rc4(key: &[u8], data: &[u8]) -> Vec<u8> {
        Rc4::new(key).apply(data)
    }

    /// Algorithm 3.3, which only a producer needs: the `/O` value for a
    /// given owner and user password pair (R2).
    fn owner_value(owner_pw: &[u8], user_pw: &[u8]) -> Vec<u8> {
        let digest = md5::compute(pad_password(owner_pw)).0;
        rc4(&digest[..5], &pad_password(user_pw))
    }

    fn file_key_r2(user_pw: &[u8], o: &[u8], p: i64, id: &[u8]) -> Vec<u8> {
        let mut ctx = md5::Context::new();
        ctx.consume(pad_password(user_pw));
        ctx.consume(o);
        ctx.consume((p as u32).to_le_bytes());
        ctx.consume(id);
        ctx.finalize().0[..5].to_vec()
    }

    fn object_key(file_key: &[u8], num: u32, gen: u16) -> Vec<u8> {
        let mut ctx = md5::Context::new();
        ctx.consume(file_key);
        ctx.consume(&num.to_le_bytes()[..3]);
        ctx.consume(gen.to_le_bytes());
        ctx.finalize().0[..(file_key.len() + 5).min(16)].to_vec()
    }

    fn assemble(objects: &[Vec<u8>], trailer_extra: &str) -> Vec<u8> {
        let mut out = b"%PDF-1.4\n".to_vec();
        let mut offsets = Vec::new();
        for (i, body) in objects.iter().enumerate() {
            offsets.push(out.len());
            let _ = write!(out, "{} 0 obj\n", i + 1);
            out.extend_from_slice(body);
            out.extend_from_slice(b"\nendobj\n");
        }
        let start = out.len();
        let _ = write!(out, "xref\n0 {}\n", offsets.len() + 1);
        out.extend_from_slice(b"0000000000 65535 f \n");
        for pos in &offsets {
            let _ = write!(out, "{pos:010} 00000 n \n");
        }
        let _ = write!(
            out,
            "trailer\n<</Size {}{trailer_extra}>>\nstartxref\n{start}\n%%EOF\n",
            offsets.len() + 1
        );
        out
    }

    fn skeleton_objects(content_stream: Vec<u8>, encrypt: Vec<u8>, info: Vec<u8>) -> Vec<Vec<u8>> {
        vec![
            b"<</Type /Catalog /Pages 2 0 R>>".to_vec(),
            b"<</Type /Pages /Kids [3 0 R] /Count 1>>".to_vec(),
            b"<</Type /Page /Parent 2 0 R /MediaBox [0 0 100 100] /Resources <<>> /Contents 4 0 R>>"
                .to_vec(),
            content_stream,
            encrypt,
            info,
        ]
    }

    /// A one-page RC4 40-bit file; returns the bytes and the plaintext
    /// content stream.
    fn build_encrypted_pdf(user_pw: &[u8], owner_pw: &[u8], p: i64) -> (Vec<u8>, Vec<u8>) {
        let id = hex::decode("0123456789abcdef0123456789abcdef").unwrap();
        let o = owner_value(owner_pw, user_pw);
        let key = file_key_r2(user_pw, &o, p, &id);
        let u = rc4(&key, &PASSWORD_PADDING);

        let content = b"0 0 1 rg 10 10 40 40 re f".to_vec();
        let enc_content = rc4(&object_key(&key, 4, 0), &content);
        let enc_title = rc4(&object_key(&key, 6, 0), b"Salted");

        let mut stream = Vec::new();
        let _ = write!(stream, "<</Length {}>>\nstream\n", enc_content.len());
        stream.extend_from_slice(&enc_content);
        stream.extend_from_slice(b"\nendstream");

        let mut encrypt = Vec::new();
        let _ = write!(
            encrypt,
            "<</Filter /Standard /V 1 /R 2 /Length 40 /P {p} /O <{}> /U <{}>>>",
            hex::encode(&o),
            hex::encode(&u)
        );

        let mut info = Vec::new();
        let _ = write!(info, "<</Title <{}>>>", hex::encode(&enc_title));

        let trailer_extra = format!(
            "/Root 1 0 R/Info 6 0 R/Encrypt 5 0 R/ID [<{id_hex}> <{id_hex}>]",
            id_hex = hex::encode(&id)
        );
        let objects = skeleton_objects(stream, encrypt, info);
        (assemble(&objects, &trailer_extra), content)
    }

    fn read_page_content(doc: &Document) -> Vec<u8> {
        doc.trailer()
            .unwrap()
            .get("Root")
            .unwrap()
            .get("Pages")
            .unwrap()
            .get("Kids")
            .unwrap()
            .get_at(0)
            .unwrap()
            .get("Contents")
            .unwrap()
            .read_stream()
            .unwrap()
    }

    #[test]
    fn test_rc4_known_vectors() {
        assert_eq!(
            rc4(b"Key", b"Plaintext"),
            hex::decode("bbf316e8d940af0ad3").unwrap()
        );
        assert_eq!(rc4(b"Wiki", b"pedia"), hex::decode("1021bf0420").unwrap());
        assert_eq!(
            rc4(b"Secret", b"Attack at dawn"),
            hex::decode("45a01f645fc35b383552544b9bf5").unwrap()
        );
    }

    #[test]
    fn test_rc4_is_symmetric() {
        let data = b"stream payload with bytes \x00\x01\xfe";
        let round = rc4(b"12345", &rc4(b"12345", data));
        assert_eq!(round, data);
    }

    #[test]
    fn test_password_padding_shapes() {
        assert_eq!(pad_password(b""), PASSWORD_PADDING);
        let p = pad_password(b"secret");
        assert_eq!(&p[..6], b"secret");
        assert_eq!(&p[6..], &PASSWORD_PADDING[..26]);
        let long = [b'x'; 40];
        assert_eq!(pad_password(&long), [b'x'; 32]);
    }

    #[test]
    fn test_empty_user_password_opens_unlocked() {
        let engine = Engine::new();
        let (bytes, content) = build_encrypted_pdf(b"", b"owner", -4);
        let doc = Document::open(&engine, &bytes).unwrap();
        assert!(!doc.needs_password().unwrap());
        assert_eq!(doc.page_count().unwrap(), 1);
        assert_eq!(
            doc.metadata("info:Title").unwrap().as_deref(),
            Some("Salted")
        );
        assert_eq!(
            doc.metadata("encryption").unwrap().as_deref(),
            Some("Standard V1 R2 40-bit RC4")
        );
        assert_eq!(read_page_content(&doc), content);
    }

    #[test]
    fn test_wrong_then_right_password() {
        let engine = Engine::new();
        let (bytes, content) = build_encrypted_pdf(b"secret", b"hidden", -44);
        let doc = Document::open(&engine, &bytes).unwrap();
        assert!(doc.needs_password().unwrap());
        assert!(matches!(doc.page_count(), Err(Error::NeedsPassword)));
        assert_eq!(doc.metadata("info:Title").unwrap(), None);

        assert_eq!(doc.authenticate("nope").unwrap(), AuthOutcome::Failed);
        assert!(doc.needs_password().unwrap());

        assert_eq!(doc.authenticate("secret").unwrap(), AuthOutcome::User);
        assert!(!doc.needs_password().unwrap());
        assert_eq!(doc.page_count().unwrap(), 1);
        assert_eq!(
            doc.metadata("info:Title").unwrap().as_deref(),
            Some("Salted")
        );
        assert_eq!(read_page_content(&doc), content);
    }

    #[test]
    fn test_owner_password_grants_everything() {
        let engine = Engine::new();
        let (bytes, _) = build_encrypted_pdf(b"secret", b"hidden", -44);
        let doc = Document::open(&engine, &bytes).unwrap();
        assert_eq!(doc.authenticate("hidden").unwrap(), AuthOutcome::Owner);
        assert!(doc.has_permission('p').unwrap());
        assert!(doc.has_permission('e').unwrap());
        assert!(doc.has_permission('n').unwrap());
    }

    #[test]
    fn test_user_permission_bits() {
        let engine = Engine::new();
        let (bytes, _) = build_encrypted_pdf(b"secret", b"hidden", -44);
        let doc = Document::open(&engine, &bytes).unwrap();
        assert_eq!(doc.authenticate("secret").unwrap(), AuthOutcome::User);
        assert!(doc.has_permission('p').unwrap());
        assert!(!doc.has_permission('e').unwrap());
        assert!(doc.has_permission('c').unwrap());
        assert!(!doc.has_permission('n').unwrap());
        assert!(doc.has_permission('f').unwrap());
        assert!(!doc.has_permission('q').unwrap());
    }

    #[test]
    fn test_v4_rejected_at_open() {
        let engine = Engine::new();
        let objects = skeleton_objects(
            b"<</Length 4>>\nstream\nnone\nendstream".to_vec(),
            b"<</Filter /Standard /V 4 /R 4 /Length 128 /P -44 /O <00> /U <00>>>".to_vec(),
            b"<</Title (plain)>>".to_vec(),
        );
        let bytes = assemble(
            &objects,
            "/Root 1 0 R/Info 6 0 R/Encrypt 5 0 R/ID [<00112233445566778899aabbccddeeff> <00112233445566778899aabbccddeeff>]",
        );
        assert!(matches!(
            Document::open(&engine, &bytes),
            Err(Error::UnsupportedEncryption(_))
        ));
    }

    #[test]
    fn test_foreign_handler_rejected() {
        let engine = Engine::new();
        let objects = skeleton_objects(
            b"<</Length 4>>\nstream\nnone\nendstream".to_vec(),
            b"<</Filter /Acme /V 1 /R 2 /Length 40 /P -44 /O <00> /U <00>>>".to_vec(),
            b"<</Title (plain)>>".to_vec(),
        );
        let bytes = assemble(&objects, "/Root 1 0 R/Encrypt 5 0 R");
        assert!(matches!(
            Document::open(&engine, &bytes),
            Err(Error::UnsupportedEncryption(_))
        ));
    }

    #[test]
    fn test_save_decrypts_once_authenticated() {
        let engine = Engine::new();
        let (bytes, content) = build_encrypted_pdf(b"secret", b"hidden", -44);
        let doc = Document::open(&engine, &bytes).unwrap();
        assert!(matches!(doc.save(""), Err(Error::NeedsPassword)));

        doc.authenticate("secret").unwrap();
        let saved = doc.save("").unwrap();
        let back = Document::open(&engine, &saved).unwrap();
        assert!(!back.needs_password().unwrap());
        assert_eq!(read_page_content(&back), content);
        assert_eq!(
            back.metadata("info:Title").unwrap().as_deref(),
            Some("Salted")
        );
    }
}
