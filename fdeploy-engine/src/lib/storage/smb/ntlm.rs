//! NTLMv2 authentication, carried in SPNEGO tokens during SESSION_SETUP.
//!
//! Key exchange is not negotiated, so the exported session key, used to sign
//! SMB2 messages, is the session base key.
use fdeploy::io_bail;
use hmac::{Hmac, Mac};
use md4::{Digest, Md4};
use md5::Md5;

use super::proto::{le_u16, le_u32, slice, utf16le};

type HmacMd5 = Hmac<Md5>;

const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

const NEGOTIATE_UNICODE: u32 = 0x0000_0001;
const REQUEST_TARGET: u32 = 0x0000_0004;
const NEGOTIATE_SIGN: u32 = 0x0000_0010;
const NEGOTIATE_NTLM: u32 = 0x0000_0200;
const NEGOTIATE_ALWAYS_SIGN: u32 = 0x0000_8000;
const NEGOTIATE_EXTENDED_SESSIONSECURITY: u32 = 0x0008_0000;
const NEGOTIATE_TARGET_INFO: u32 = 0x0080_0000;
const NEGOTIATE_VERSION: u32 = 0x0200_0000;
const NEGOTIATE_128: u32 = 0x2000_0000;
const NEGOTIATE_56: u32 = 0x8000_0000;

const FLAGS: u32 = NEGOTIATE_UNICODE
    | REQUEST_TARGET
    | NEGOTIATE_SIGN
    | NEGOTIATE_NTLM
    | NEGOTIATE_ALWAYS_SIGN
    | NEGOTIATE_EXTENDED_SESSIONSECURITY
    | NEGOTIATE_TARGET_INFO
    | NEGOTIATE_VERSION
    | NEGOTIATE_128
    | NEGOTIATE_56;

/// Windows 10, NTLM revision 15
const VERSION: [u8; 8] = [10, 0, 0x61, 0x4A, 0, 0, 0, 0x0F];

const AV_EOL: u16 = 0;
const AV_TIMESTAMP: u16 = 7;

const WORKSTATION: &str = "FDEPLOY";

fn hmac_md5(key: &[u8], parts: &[&[u8]]) -> [u8; 16] {
    let mut mac = HmacMd5::new_from_slice(key).expect("HMAC accepts keys of any length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

pub fn ntowf_v1(password: &str) -> [u8; 16] {
    Md4::digest(utf16le(password)).into()
}

pub fn ntowf_v2(user: &str, password: &str, domain: &str) -> [u8; 16] {
    let identity = utf16le(&format!("{}{}", user.to_uppercase(), domain));
    hmac_md5(&ntowf_v1(password), &[&identity])
}

/// The NEGOTIATE_MESSAGE opening the exchange
pub fn negotiate() -> Vec<u8> {
    let mut msg = Vec::with_capacity(40);
    msg.extend_from_slice(SIGNATURE);
    msg.extend_from_slice(&1u32.to_le_bytes());
    msg.extend_from_slice(&FLAGS.to_le_bytes());
    // empty domain and workstation
    for _ in 0..2 {
        msg.extend_from_slice(&[0, 0, 0, 0]);
        msg.extend_from_slice(&40u32.to_le_bytes());
    }
    msg.extend_from_slice(&VERSION);
    msg
}

#[derive(Debug, Clone)]
pub struct Challenge {
    pub flags: u32,
    pub server_challenge: [u8; 8],
    pub target_info: Vec<u8>,
}

impl Challenge {
    pub fn decode(msg: &[u8]) -> fdeploy::Result<Self> {
        if slice(msg, 0, 8)? != SIGNATURE || le_u32(msg, 8)? != 2 {
            io_bail!("expected an NTLM CHALLENGE_MESSAGE");
        }
        let flags = le_u32(msg, 20)?;
        let mut server_challenge = [0u8; 8];
        server_challenge.copy_from_slice(slice(msg, 24, 8)?);
        let info_len = le_u16(msg, 40)? as usize;
        let info_off = le_u32(msg, 44)? as usize;
        let target_info = slice(msg, info_off, info_len)?.to_vec();
        Ok(Self {
            flags,
            server_challenge,
            target_info,
        })
    }

    /// Server time announced in the target info, if any
    pub fn timestamp(&self) -> Option<u64> {
        let mut pos = 0;
        while let (Ok(id), Ok(len)) = (
            le_u16(&self.target_info, pos),
            le_u16(&self.target_info, pos + 2),
        ) {
            let len = len as usize;
            if id == AV_EOL {
                break;
            }
            if id == AV_TIMESTAMP && len == 8 {
                let value = slice(&self.target_info, pos + 4, 8).ok()?;
                let mut ts = [0u8; 8];
                ts.copy_from_slice(value);
                return Some(u64::from_le_bytes(ts));
            }
            pos += 4 + len;
        }
        None
    }
}

/// The `temp` structure hashed into the NTLMv2 response
pub fn client_blob(time: u64, client_challenge: &[u8; 8], target_info: &[u8]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(32 + target_info.len());
    blob.extend_from_slice(&[1, 1, 0, 0, 0, 0, 0, 0]);
    blob.extend_from_slice(&time.to_le_bytes());
    blob.extend_from_slice(client_challenge);
    blob.extend_from_slice(&[0; 4]);
    blob.extend_from_slice(target_info);
    blob.extend_from_slice(&[0; 4]);
    blob
}

pub struct Authenticate {
    pub message: Vec<u8>,
    pub session_key: [u8; 16],
}

pub struct Credentials<'a> {
    pub user: &'a str,
    pub password: &'a str,
    pub domain: &'a str,
}

impl Credentials<'_> {
    /// Builds the AUTHENTICATE_MESSAGE answering `challenge`.
    /// `time` is a FILETIME, used when the server does not provide one.
    pub fn authenticate(
        &self,
        challenge: &Challenge,
        client_challenge: [u8; 8],
        time: u64,
    ) -> Authenticate {
        let ntowf = ntowf_v2(self.user, self.password, self.domain);
        let server_time = challenge.timestamp();

        let blob = client_blob(
            server_time.unwrap_or(time),
            &client_challenge,
            &challenge.target_info,
        );
        let proof = hmac_md5(&ntowf, &[&challenge.server_challenge, &blob]);
        let session_key = hmac_md5(&ntowf, &[&proof]);

        let mut nt_response = proof.to_vec();
        nt_response.extend_from_slice(&blob);

        let lm_response = if server_time.is_some() {
            vec![0; 24]
        } else {
            let mut lm = hmac_md5(&ntowf, &[&challenge.server_challenge, &client_challenge]).to_vec();
            lm.extend_from_slice(&client_challenge);
            lm
        };

        let domain = utf16le(self.domain);
        let user = utf16le(self.user);
        let workstation = utf16le(WORKSTATION);
        let fields: [&[u8]; 6] = [&lm_response, &nt_response, &domain, &user, &workstation, &[]];

        const PAYLOAD_OFFSET: usize = 72;
        let mut msg = Vec::with_capacity(PAYLOAD_OFFSET + fields.iter().map(|f| f.len()).sum::<usize>());
        msg.extend_from_slice(SIGNATURE);
        msg.extend_from_slice(&3u32.to_le_bytes());
        let mut offset = PAYLOAD_OFFSET;
        for field in fields {
            msg.extend_from_slice(&(field.len() as u16).to_le_bytes());
            msg.extend_from_slice(&(field.len() as u16).to_le_bytes());
            msg.extend_from_slice(&(offset as u32).to_le_bytes());
            offset += field.len();
        }
        let flags = (challenge.flags & FLAGS) | NEGOTIATE_UNICODE;
        msg.extend_from_slice(&flags.to_le_bytes());
        msg.extend_from_slice(&VERSION);
        for field in fields {
            msg.extend_from_slice(field);
        }

        Authenticate {
            message: msg,
            session_key,
        }
    }
}

/// Minimal SPNEGO (RFC 4178) envelopes around NTLM messages
pub mod spnego {
    use super::SIGNATURE;

    const SPNEGO_OID: &[u8] = &[0x2b, 0x06, 0x01, 0x05, 0x05, 0x02];
    const NTLMSSP_OID: &[u8] = &[0x2b, 0x06, 0x01, 0x04, 0x01, 0x82, 0x37, 0x02, 0x02, 0x0a];

    fn der(tag: u8, content: &[u8]) -> Vec<u8> {
        let len = content.len();
        let mut out = Vec::with_capacity(len + 4);
        out.push(tag);
        if len < 0x80 {
            out.push(len as u8);
        } else if len < 0x100 {
            out.extend_from_slice(&[0x81, len as u8]);
        } else {
            out.extend_from_slice(&[0x82, (len >> 8) as u8, len as u8]);
        }
        out.extend_from_slice(content);
        out
    }

    /// NegTokenInit offering NTLM, with the first NTLM message
    pub fn init(token: &[u8]) -> Vec<u8> {
        let mech_types = der(0xa0, &der(0x30, &der(0x06, NTLMSSP_OID)));
        let mech_token = der(0xa2, &der(0x04, token));
        let neg_token_init = der(0xa0, &der(0x30, &[mech_types, mech_token].concat()));
        der(0x60, &[der(0x06, SPNEGO_OID), neg_token_init].concat())
    }

    /// NegTokenResp carrying a subsequent NTLM message
    pub fn response(token: &[u8]) -> Vec<u8> {
        der(0xa1, &der(0x30, &der(0xa2, &der(0x04, token))))
    }

    /// Locates the NTLM message inside a server token.
    /// NTLM messages carry their own offsets, trailing bytes are harmless.
    pub fn find_ntlmssp(token: &[u8]) -> Option<&[u8]> {
        token
            .windows(SIGNATURE.len())
            .position(|w| w == SIGNATURE)
            .map(|pos| &token[pos..])
    }
}
