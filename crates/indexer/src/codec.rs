//! Raw transaction wire decoding
//!
//! Extracts the fields the pipeline indexes (type, sender, contract id,
//! function name) from the node's raw transaction encoding. Anything the
//! reader cannot walk past surfaces as a parse error and the caller falls
//! back to the HTTP lookup.

use sha2::{Digest, Sha256};

use secondlayer_core::{Error, Result};

/// Fields extracted from a raw transaction
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedTx {
    pub tx_type: String,
    pub sender: String,
    pub contract_id: Option<String>,
    pub function_name: Option<String>,
}

const VERSION_MAINNET: u8 = 0x00;

const AUTH_STANDARD: u8 = 0x04;
const AUTH_SPONSORED: u8 = 0x05;

const HASH_MODE_P2PKH: u8 = 0x00;
const HASH_MODE_P2SH: u8 = 0x01;
const HASH_MODE_P2WPKH: u8 = 0x02;
const HASH_MODE_P2WSH: u8 = 0x03;

// Address versions: single-sig and multi-sig, per network
const ADDR_MAINNET_SINGLE: u8 = 22; // "SP"
const ADDR_MAINNET_MULTI: u8 = 20; // "SM"
const ADDR_TESTNET_SINGLE: u8 = 26; // "ST"
const ADDR_TESTNET_MULTI: u8 = 21; // "SN"

/// Decode a hex-encoded raw transaction
pub fn decode_raw_tx(raw: &str) -> Result<DecodedTx> {
    let raw = raw.strip_prefix("0x").unwrap_or(raw);
    let bytes = hex::decode(raw).map_err(|e| Error::parse(format!("raw_tx hex: {}", e)))?;
    let mut reader = Reader::new(&bytes);

    let version = reader.u8()?;
    let _chain_id = reader.u32()?;

    let auth_type = reader.u8()?;
    let (hash_mode, signer) = read_spending_condition(&mut reader)?;
    if auth_type == AUTH_SPONSORED {
        // Sponsor pays the fee; the origin condition already read is the sender.
        read_spending_condition(&mut reader)?;
    } else if auth_type != AUTH_STANDARD {
        return Err(Error::parse(format!("unknown auth type {:#x}", auth_type)));
    }

    let sender = sender_address(version, hash_mode, &signer)?;

    let _anchor_mode = reader.u8()?;
    let _post_condition_mode = reader.u8()?;
    let post_condition_count = reader.u32()?;
    for _ in 0..post_condition_count {
        skip_post_condition(&mut reader)?;
    }

    let payload_type = reader.u8()?;
    let (tx_type, contract_id, function_name) = match payload_type {
        // Token transfer: recipient principal, amount, memo
        0x00 => ("token_transfer".to_string(), None, None),
        // Smart contract deploy: the contract id is sender.name
        0x01 => {
            let name = reader.short_string()?;
            (
                "smart_contract".to_string(),
                Some(format!("{}.{}", sender, name)),
                None,
            )
        }
        // Contract call: callee address, contract name, function name
        0x02 => {
            let addr_version = reader.u8()?;
            let addr_hash = reader.bytes(20)?;
            let contract_name = reader.short_string()?;
            let function = reader.short_string()?;
            let callee = c32_address(addr_version, &addr_hash)?;
            (
                "contract_call".to_string(),
                Some(format!("{}.{}", callee, contract_name)),
                Some(function),
            )
        }
        0x03 => ("poison_microblock".to_string(), None, None),
        0x04 | 0x05 | 0x08 => ("coinbase".to_string(), None, None),
        // Versioned deploy carries a clarity version byte before the name
        0x06 => {
            let _clarity_version = reader.u8()?;
            let name = reader.short_string()?;
            (
                "smart_contract".to_string(),
                Some(format!("{}.{}", sender, name)),
                None,
            )
        }
        0x07 => ("tenure_change".to_string(), None, None),
        other => return Err(Error::parse(format!("unknown payload type {:#x}", other))),
    };

    Ok(DecodedTx {
        tx_type,
        sender,
        contract_id,
        function_name,
    })
}

/// Read one spending condition, returning (hash_mode, signer hash160)
fn read_spending_condition(reader: &mut Reader<'_>) -> Result<(u8, [u8; 20])> {
    let hash_mode = reader.u8()?;
    let signer: [u8; 20] = reader
        .bytes(20)?
        .try_into()
        .map_err(|_| Error::parse("short signer hash"))?;
    let _nonce = reader.u64()?;
    let _fee = reader.u64()?;

    match hash_mode {
        HASH_MODE_P2PKH | HASH_MODE_P2WPKH => {
            let _key_encoding = reader.u8()?;
            reader.bytes(65)?; // recoverable signature
        }
        HASH_MODE_P2SH | HASH_MODE_P2WSH => {
            let field_count = reader.u32()?;
            for _ in 0..field_count {
                let field_id = reader.u8()?;
                match field_id {
                    0x00 | 0x01 => {
                        reader.bytes(33)?; // public key
                    }
                    0x02 | 0x03 => {
                        reader.bytes(65)?; // signature
                    }
                    other => {
                        return Err(Error::parse(format!("unknown auth field {:#x}", other)))
                    }
                }
            }
            let _signatures_required = reader.u16()?;
        }
        other => return Err(Error::parse(format!("unknown hash mode {:#x}", other))),
    }

    Ok((hash_mode, signer))
}

/// Derive the sender address from tx version and signature hash mode
fn sender_address(tx_version: u8, hash_mode: u8, signer: &[u8; 20]) -> Result<String> {
    let mainnet = tx_version == VERSION_MAINNET;
    let single_sig = matches!(hash_mode, HASH_MODE_P2PKH | HASH_MODE_P2WPKH);
    let addr_version = match (mainnet, single_sig) {
        (true, true) => ADDR_MAINNET_SINGLE,
        (true, false) => ADDR_MAINNET_MULTI,
        (false, true) => ADDR_TESTNET_SINGLE,
        (false, false) => ADDR_TESTNET_MULTI,
    };
    c32_address(addr_version, signer)
}

/// Skip one post condition without materializing it
fn skip_post_condition(reader: &mut Reader<'_>) -> Result<()> {
    let kind = reader.u8()?;
    skip_pc_principal(reader)?;
    match kind {
        // STX: condition code + amount
        0x00 => {
            reader.u8()?;
            reader.u64()?;
        }
        // Fungible asset: asset info + condition code + amount
        0x01 => {
            skip_asset_info(reader)?;
            reader.u8()?;
            reader.u64()?;
        }
        // Non-fungible asset: asset info + asset value + condition code
        0x02 => {
            skip_asset_info(reader)?;
            skip_clarity_value(reader)?;
            reader.u8()?;
        }
        other => return Err(Error::parse(format!("unknown post condition {:#x}", other))),
    }
    Ok(())
}

fn skip_pc_principal(reader: &mut Reader<'_>) -> Result<()> {
    let kind = reader.u8()?;
    match kind {
        // Origin: no body
        0x01 => {}
        // Standard principal: version + hash160
        0x02 => {
            reader.bytes(21)?;
        }
        // Contract principal: version + hash160 + name
        0x03 => {
            reader.bytes(21)?;
            reader.short_string()?;
        }
        other => {
            return Err(Error::parse(format!(
                "unknown post condition principal {:#x}",
                other
            )))
        }
    }
    Ok(())
}

fn skip_asset_info(reader: &mut Reader<'_>) -> Result<()> {
    reader.bytes(21)?; // issuer version + hash160
    reader.short_string()?; // contract name
    reader.short_string()?; // asset name
    Ok(())
}

/// Skip a serialized clarity value. Only the shapes that appear in post
/// conditions are supported; anything else aborts the decode and the caller
/// falls back.
fn skip_clarity_value(reader: &mut Reader<'_>) -> Result<()> {
    let type_id = reader.u8()?;
    match type_id {
        // int / uint
        0x00 | 0x01 => {
            reader.bytes(16)?;
        }
        // buffer
        0x02 => {
            let len = reader.u32()? as usize;
            reader.bytes(len)?;
        }
        // bool true / false
        0x03 | 0x04 => {}
        // standard principal
        0x05 => {
            reader.bytes(21)?;
        }
        // contract principal
        0x06 => {
            reader.bytes(21)?;
            reader.short_string()?;
        }
        // string-ascii / string-utf8
        0x0d | 0x0e => {
            let len = reader.u32()? as usize;
            reader.bytes(len)?;
        }
        other => return Err(Error::parse(format!("unsupported clarity value {:#x}", other))),
    }
    Ok(())
}

/// Sequential byte reader over a raw transaction
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        if self.pos + len > self.data.len() {
            return Err(Error::parse(format!(
                "truncated raw tx: need {} bytes at offset {}",
                len, self.pos
            )));
        }
        let slice = self.data[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.bytes(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&b);
        Ok(u64::from_be_bytes(buf))
    }

    /// A length-prefixed name (1-byte length)
    fn short_string(&mut self) -> Result<String> {
        let len = self.u8()? as usize;
        let bytes = self.bytes(len)?;
        String::from_utf8(bytes).map_err(|e| Error::parse(format!("invalid name: {}", e)))
    }
}

const C32_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Render a versioned hash160 as a checksummed c32 address string
pub fn c32_address(version: u8, hash160: &[u8]) -> Result<String> {
    if version >= 32 {
        return Err(Error::parse(format!("address version out of range: {}", version)));
    }
    if hash160.len() != 20 {
        return Err(Error::parse("address hash must be 20 bytes"));
    }

    let mut check_input = Vec::with_capacity(21);
    check_input.push(version);
    check_input.extend_from_slice(hash160);
    let first = Sha256::digest(&check_input);
    let second = Sha256::digest(first);

    let mut payload = hash160.to_vec();
    payload.extend_from_slice(&second[..4]);

    Ok(format!(
        "S{}{}",
        C32_ALPHABET[version as usize] as char,
        c32_encode(&payload)
    ))
}

/// Base-32 encode with the c32 alphabet, 5 bits at a time from the least
/// significant end, preserving leading zero bytes.
fn c32_encode(data: &[u8]) -> String {
    let mut out: Vec<u8> = Vec::new();
    let mut carry: u32 = 0;
    let mut carry_bits: u32 = 0;

    for byte in data.iter().rev() {
        carry |= (*byte as u32) << carry_bits;
        carry_bits += 8;
        while carry_bits >= 5 {
            out.push(C32_ALPHABET[(carry & 0x1f) as usize]);
            carry >>= 5;
            carry_bits -= 5;
        }
    }
    if carry_bits > 0 {
        out.push(C32_ALPHABET[(carry & 0x1f) as usize]);
    }

    // Strip artificial leading zeros from the bit packing, then restore one
    // digit per actual leading zero byte.
    while out.last() == Some(&b'0') {
        out.pop();
    }
    for byte in data {
        if *byte == 0 {
            out.push(b'0');
        } else {
            break;
        }
    }

    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}
