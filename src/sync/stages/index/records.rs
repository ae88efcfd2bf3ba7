use lodestone_macros::{Decode, Encode};
use num_bigint::BigUint;

use crate::{
    chain::Txid,
    storage::encdec::{
        Decode, DecodingResult, Encode, malformed_input, read_bigint, read_varint, read_varuint,
        write_bigint, write_varint, write_varuint,
    },
};

/// One input or output of a transaction as cached in the txAddresses
/// column: the address descriptor and the value moved. `spent` is
/// meaningful for outputs only and is the record's single piece of mutable
/// state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxAddr {
    pub descriptor: Vec<u8>,
    pub value_sat: BigUint,
    pub spent: bool,
}

impl TxAddr {
    pub fn new(descriptor: Vec<u8>, value_sat: BigUint) -> Self {
        Self {
            descriptor,
            value_sat,
            spent: false,
        }
    }
}

/// Per-tx record caching addresses and values of all inputs and outputs so
/// history queries never re-fetch or re-parse the tx.
///
/// Layout: `height(varint) ‖ nInputs(varuint) ‖ input* ‖ nOutputs(varuint)
/// ‖ output*`, each io being a length-prefix varint whose low bit carries
/// the SPENT flag (outputs only), the descriptor bytes, then the packed
/// value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TxAddressesRecord {
    pub height: u32,
    pub inputs: Vec<TxAddr>,
    pub outputs: Vec<TxAddr>,
}

fn write_tx_addr(io: &TxAddr, spendable: bool, out: &mut Vec<u8>) {
    let flag = (spendable && io.spent) as u64;
    // the length prefix is zigzag(len) with the low bit replaced by the flag
    write_varuint(((io.descriptor.len() as u64) << 1) | flag, out);
    out.extend_from_slice(&io.descriptor);
    write_bigint(&io.value_sat, out);
}

fn read_tx_addr(bytes: &[u8]) -> DecodingResult<'_, TxAddr> {
    let (prefix, bytes) = read_varuint(bytes)?;
    let spent = prefix & 1 == 1;
    let len = (prefix >> 1) as usize;

    let (descriptor, bytes) = bytes
        .split_at_checked(len)
        .ok_or(malformed_input("tx addr descriptor insufficient bytes"))?;
    let (value_sat, bytes) = read_bigint(bytes)?;

    Ok((
        TxAddr {
            descriptor: descriptor.to_vec(),
            value_sat,
            spent,
        },
        bytes,
    ))
}

impl Encode for TxAddressesRecord {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 * (self.inputs.len() + self.outputs.len()));

        write_varint(self.height as i64, &mut out);

        write_varuint(self.inputs.len() as u64, &mut out);
        for input in &self.inputs {
            write_tx_addr(input, false, &mut out);
        }

        write_varuint(self.outputs.len() as u64, &mut out);
        for output in &self.outputs {
            write_tx_addr(output, true, &mut out);
        }

        out
    }
}

impl Decode for TxAddressesRecord {
    fn decode(bytes: &[u8]) -> DecodingResult<'_, Self> {
        let (height, bytes) = read_varint(bytes)?;
        let height =
            u32::try_from(height).map_err(|_| malformed_input("tx addresses height"))?;

        let (n_inputs, mut bytes) = read_varuint(bytes)?;
        let mut inputs = Vec::with_capacity(n_inputs as usize);
        for _ in 0..n_inputs {
            let (input, rest) = read_tx_addr(bytes)?;
            inputs.push(input);
            bytes = rest;
        }

        let (n_outputs, mut bytes) = read_varuint(bytes)?;
        let mut outputs = Vec::with_capacity(n_outputs as usize);
        for _ in 0..n_outputs {
            let (output, rest) = read_tx_addr(bytes)?;
            outputs.push(output);
            bytes = rest;
        }

        Ok((
            Self {
                height,
                inputs,
                outputs,
            },
            bytes,
        ))
    }
}

/// One contribution of a tx to an address, as stored in the addresses
/// index: outputs carry their vout, inputs the input index within the
/// spending tx, with the low bit of the encoded index marking inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrTxRecord {
    pub txid: Txid,
    pub io_index: u32,
    pub is_input: bool,
}

/// Value of one addresses-index row: the concatenated contributions of one
/// (descriptor, height) pair, in block append order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AddrTxRecords(pub Vec<AddrTxRecord>);

impl Encode for AddrTxRecords {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.0.len() * 33);
        for record in &self.0 {
            out.extend_from_slice(&record.txid);
            write_varuint(
                ((record.io_index as u64) << 1) | record.is_input as u64,
                &mut out,
            );
        }
        out
    }
}

impl Decode for AddrTxRecords {
    fn decode(mut bytes: &[u8]) -> DecodingResult<'_, Self> {
        let mut records = Vec::new();
        while !bytes.is_empty() {
            let (txid, rest) = <Txid>::decode(bytes)?;
            let (io, rest) = read_varuint(rest)?;
            records.push(AddrTxRecord {
                txid,
                io_index: (io >> 1) as u32,
                is_input: io & 1 == 1,
            });
            bytes = rest;
        }
        Ok((Self(records), bytes))
    }
}

/// Outpoint whose SPENT flag a block flipped, as recorded in the
/// blockAddresses column for undo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpentOutpoint {
    pub txid: Txid,
    pub vout: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockAddress {
    pub descriptor: Vec<u8>,
    pub spent: Vec<SpentOutpoint>,
}

/// Per-block undo record: every address the block touched and, for each,
/// the prior-tx outpoints whose spent flags were set.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockAddressesRecord(pub Vec<BlockAddress>);

impl Encode for BlockAddressesRecord {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for address in &self.0 {
            write_varint(address.descriptor.len() as i64, &mut out);
            out.extend_from_slice(&address.descriptor);
            write_varint(address.spent.len() as i64, &mut out);
            for outpoint in &address.spent {
                out.extend_from_slice(&outpoint.txid);
                write_varint(outpoint.vout as i64, &mut out);
            }
        }
        out
    }
}

impl Decode for BlockAddressesRecord {
    fn decode(mut bytes: &[u8]) -> DecodingResult<'_, Self> {
        let mut addresses = Vec::new();

        while !bytes.is_empty() {
            let (len, rest) = read_varint(bytes)?;
            let len = usize::try_from(len).map_err(|_| malformed_input("descriptor length"))?;
            let (descriptor, rest) = rest
                .split_at_checked(len)
                .ok_or(malformed_input("block address descriptor"))?;

            let (n_spent, mut rest) = read_varint(rest)?;
            let n_spent =
                usize::try_from(n_spent).map_err(|_| malformed_input("spent count"))?;

            let mut spent = Vec::with_capacity(n_spent);
            for _ in 0..n_spent {
                let (txid, r) = <Txid>::decode(rest)?;
                let (vout, r) = read_varint(r)?;
                spent.push(SpentOutpoint {
                    txid,
                    vout: u32::try_from(vout).map_err(|_| malformed_input("outpoint vout"))?,
                });
                rest = r;
            }

            addresses.push(BlockAddress {
                descriptor: descriptor.to_vec(),
                spent,
            });
            bytes = rest;
        }

        Ok((Self(addresses), bytes))
    }
}

/// Running balance of one address: distinct referencing txs, total ever
/// sent, and the spendable balance.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AddressBalanceRecord {
    pub tx_count: u32,
    pub sent_sat: BigUint,
    pub balance_sat: BigUint,
}

impl AddressBalanceRecord {
    pub fn received_sat(&self) -> BigUint {
        &self.balance_sat + &self.sent_sat
    }
}

impl Encode for AddressBalanceRecord {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        write_varuint(self.tx_count as u64, &mut out);
        write_bigint(&self.sent_sat, &mut out);
        write_bigint(&self.balance_sat, &mut out);
        out
    }
}

impl Decode for AddressBalanceRecord {
    fn decode(bytes: &[u8]) -> DecodingResult<'_, Self> {
        let (tx_count, bytes) = u32::decode(bytes)?;
        let (sent_sat, bytes) = read_bigint(bytes)?;
        let (balance_sat, bytes) = read_bigint(bytes)?;
        Ok((
            Self {
                tx_count,
                sent_sat,
                balance_sat,
            },
            bytes,
        ))
    }
}

/// Value of one height row: the block hash plus the summary the address
/// view needs when rendering confirmed txs.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct BlockInfoRecord {
    pub hash: [u8; 32],
    pub time: i64,
    pub tx_count: u32,
    pub size: u32,
}

/// Concatenated txids of one block, in block order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockTxidsRecord(pub Vec<Txid>);

impl Encode for BlockTxidsRecord {
    fn encode(&self) -> Vec<u8> {
        self.0.concat()
    }
}

impl Decode for BlockTxidsRecord {
    fn decode(mut bytes: &[u8]) -> DecodingResult<'_, Self> {
        let mut txids = Vec::with_capacity(bytes.len() / 32);
        while !bytes.is_empty() {
            let (txid, rest) = <Txid>::decode(bytes)?;
            txids.push(txid);
            bytes = rest;
        }
        Ok((Self(txids), bytes))
    }
}

/// Raw packed transaction as produced by the chain parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedTxRecord(pub Vec<u8>);

impl Encode for PackedTxRecord {
    fn encode(&self) -> Vec<u8> {
        self.0.clone()
    }
}

impl Decode for PackedTxRecord {
    fn decode(bytes: &[u8]) -> DecodingResult<'_, Self> {
        Ok((Self(bytes.to_vec()), &[]))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct StatePoint {
    pub height: u32,
    pub hash: [u8; 32],
}

/// The internal-state sentinel, rewritten on mount and on every commit.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct InternalStateRecord {
    pub coin: String,
    pub schema_version: u32,
    pub best: Option<StatePoint>,
    pub initial_sync: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn descriptor(hex_str: &str) -> Vec<u8> {
        hex::decode(hex_str).unwrap()
    }

    #[test]
    fn tx_addresses_fixture() {
        // two inputs, one spent output; length prefixes carry 2*len with the
        // low spent bit, values are packed bigints
        let record = TxAddressesRecord {
            height: 0,
            inputs: vec![
                TxAddr::new(
                    descriptor("001443aac20a116e09ea4f7914be1c55e4c17aa600b7"),
                    BigUint::ZERO,
                ),
                TxAddr::new(
                    descriptor("001454633aa8bd2e552bd4e89c01e73c1b7905eb5846"),
                    BigUint::from(1234123421342341234u64),
                ),
            ],
            outputs: vec![TxAddr {
                descriptor: descriptor("001443aac20a116e09ea4f7914be1c55e4c17aa600b7"),
                value_sat: BigUint::from(1u8),
                spent: true,
            }],
        };

        let encoded = record.encode();
        assert_eq!(
            hex::encode(&encoded),
            "00\
             02\
             2c001443aac20a116e09ea4f7914be1c55e4c17aa600b700\
             2c001454633aa8bd2e552bd4e89c01e73c1b7905eb58460811207cb68a199872\
             01\
             2d001443aac20a116e09ea4f7914be1c55e4c17aa600b70101"
        );

        let (decoded, rest) = TxAddressesRecord::decode(&encoded).unwrap();
        assert_eq!(decoded, record);
        assert!(rest.is_empty());
    }

    #[test]
    fn tx_addresses_empty_descriptors() {
        let record = TxAddressesRecord {
            height: 123_456,
            inputs: vec![TxAddr::new(vec![], BigUint::from(1234u32))],
            outputs: vec![
                TxAddr::new(vec![], BigUint::from(5678u32)),
                TxAddr {
                    descriptor: vec![],
                    value_sat: BigUint::from(98u32),
                    spent: true,
                },
            ],
        };

        let encoded = record.encode();
        let (decoded, _) = TxAddressesRecord::decode(&encoded).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn tx_addresses_refuses_truncation() {
        let record = TxAddressesRecord {
            height: 5,
            inputs: vec![],
            outputs: vec![TxAddr::new(vec![0xac; 25], BigUint::from(42u8))],
        };
        let encoded = record.encode();
        for cut in 1..encoded.len() {
            assert!(
                TxAddressesRecord::decode(&encoded[..cut]).is_err(),
                "decode of {cut}-byte prefix should fail"
            );
        }
    }

    #[test]
    fn addr_tx_records_io_encoding() {
        // outputs encode 2*vout, inputs 2*index+1
        let records = AddrTxRecords(vec![
            AddrTxRecord {
                txid: [0xaa; 32],
                io_index: 0,
                is_input: false,
            },
            AddrTxRecord {
                txid: [0xbb; 32],
                io_index: 1,
                is_input: true,
            },
        ]);

        let encoded = records.encode();
        assert_eq!(encoded[32], 0x00);
        assert_eq!(encoded[65], 0x03);

        let (decoded, _) = AddrTxRecords::decode(&encoded).unwrap();
        assert_eq!(decoded, records);
    }

    #[test]
    fn block_addresses_fixture() {
        // authoritative layout sample: per address a zigzag length prefix,
        // the descriptor, then zigzag-counted flipped outpoints
        let txid_b1t2 = "effd9ef509383d536b1c8af5bf434c8efbf521a4f2befd4022bbd68694b4ac75";
        let hex_record = format!(
            "3276a914b434eb0c1a3b7a02e8a29cc616e791ef1e0bf51f88ac00\
             3276a9143f8ba3fda3ba7b69f5818086e12223c6dd25e3c888ac00\
             3276a914a08eae93007f22668ab5e4a9c83c8cd1c325e3e088ac02{txid_b1t2}00\
             2ea9144a21db08fb6882cb152e1ff06780a430740f77048702{txid_b1t2}02\
             3276a914ccaaaf374e1b06cb83118453d102587b4273d09588ac00",
        );
        let bytes = hex::decode(&hex_record).unwrap();

        let (decoded, rest) = BlockAddressesRecord::decode(&bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded.0.len(), 5);
        assert_eq!(
            hex::encode(&decoded.0[2].descriptor),
            "76a914a08eae93007f22668ab5e4a9c83c8cd1c325e3e088ac"
        );
        assert_eq!(
            decoded.0[2].spent,
            vec![SpentOutpoint {
                txid: crate::chain::txid_from_hex(txid_b1t2).unwrap(),
                vout: 0
            }]
        );
        assert_eq!(decoded.0[3].spent[0].vout, 1);
        assert!(decoded.0[4].spent.is_empty());

        assert_eq!(hex::encode(decoded.encode()), hex_record);
    }

    #[test]
    fn address_balance_fixture() {
        let record = AddressBalanceRecord {
            tx_count: 1,
            sent_sat: BigUint::ZERO,
            balance_sat: BigUint::from(100_000_000u64),
        };
        // varuint count, packed zero, packed 0x05f5e100
        assert_eq!(hex::encode(record.encode()), "01000405f5e100");
        assert_eq!(
            AddressBalanceRecord::decode_all(&record.encode()).unwrap(),
            record
        );
        assert_eq!(record.received_sat(), BigUint::from(100_000_000u64));
    }

    #[test]
    fn internal_state_round_trips() {
        let state = InternalStateRecord {
            coin: "bitcoin-testnet".to_string(),
            schema_version: 1,
            best: Some(StatePoint {
                height: 225_494,
                hash: [0x11; 32],
            }),
            initial_sync: false,
        };
        let encoded = state.encode();
        assert_eq!(InternalStateRecord::decode_all(&encoded).unwrap(), state);
    }

    proptest! {
        #[test]
        fn tx_addresses_round_trip(
            height in 0u32..2_000_000,
            ios in proptest::collection::vec(
                (proptest::collection::vec(any::<u8>(), 0..40), any::<u64>(), any::<bool>(), any::<bool>()),
                0..8,
            ),
        ) {
            let mut record = TxAddressesRecord { height, ..Default::default() };
            for (descriptor, value, spent, is_input) in ios {
                let io = TxAddr { descriptor, value_sat: BigUint::from(value), spent: spent && !is_input };
                if is_input {
                    record.inputs.push(TxAddr { spent: false, ..io });
                } else {
                    record.outputs.push(io);
                }
            }

            let encoded = record.encode();
            let (decoded, rest) = TxAddressesRecord::decode(&encoded).unwrap();
            prop_assert_eq!(decoded, record);
            prop_assert!(rest.is_empty());
        }

        #[test]
        fn block_addresses_round_trip(
            addrs in proptest::collection::vec(
                (
                    proptest::collection::vec(any::<u8>(), 1..40),
                    proptest::collection::vec((any::<[u8; 32]>(), any::<u16>()), 0..5),
                ),
                0..6,
            ),
        ) {
            let record = BlockAddressesRecord(
                addrs
                    .into_iter()
                    .map(|(descriptor, spent)| BlockAddress {
                        descriptor,
                        spent: spent
                            .into_iter()
                            .map(|(txid, vout)| SpentOutpoint { txid, vout: vout as u32 })
                            .collect(),
                    })
                    .collect(),
            );

            let encoded = record.encode();
            let (decoded, rest) = BlockAddressesRecord::decode(&encoded).unwrap();
            prop_assert_eq!(decoded, record);
            prop_assert!(rest.is_empty());
        }
    }
}
