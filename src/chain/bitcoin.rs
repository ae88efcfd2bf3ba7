use std::str::FromStr;

use bitcoin::{Address, Network, Script, ScriptBuf};
use num_bigint::BigUint;

use crate::error::Error;

use super::{AddressDescriptor, ChainParser};

/// Script parser for bitcoin-family coins. The address descriptor is the
/// output script itself, with equivalent script forms collapsed (P2PK is
/// normalized to the P2PKH script of the same key).
pub struct BitcoinParser {
    coin: String,
    network: Network,
    decimals: u32,
}

impl BitcoinParser {
    pub fn new(coin: &str) -> Result<Self, Error> {
        let network = match coin {
            "bitcoin" => Network::Bitcoin,
            "bitcoin-testnet" => Network::Testnet,
            "bitcoin-regtest" => Network::Regtest,
            other => return Err(Error::Config(format!("unknown coin '{other}'"))),
        };

        Ok(Self {
            coin: coin.to_string(),
            network,
            decimals: 8,
        })
    }
}

impl ChainParser for BitcoinParser {
    fn coin_name(&self) -> &str {
        &self.coin
    }

    fn address_to_script(&self, address: &str) -> Result<Vec<u8>, Error> {
        let parsed = Address::from_str(address).map_err(|e| Error::invalid(e))?;
        let checked = parsed
            .require_network(self.network)
            .map_err(|_| Error::invalid(format!("address '{address}' is for another network")))?;

        Ok(checked.script_pubkey().into_bytes())
    }

    fn script_to_descriptor(&self, script: &[u8]) -> AddressDescriptor {
        let script = Script::from_bytes(script);

        if let Some(pubkey) = script.p2pk_public_key() {
            return ScriptBuf::new_p2pkh(&pubkey.pubkey_hash()).into_bytes();
        }

        script.to_bytes()
    }

    fn descriptor_to_addresses(&self, descriptor: &[u8]) -> Result<(Vec<String>, bool), Error> {
        let script = Script::from_bytes(descriptor);

        match Address::from_script(script, self.network) {
            Ok(address) => Ok((vec![address.to_string()], true)),
            Err(_) => Err(Error::not_found("descriptor has no address form")),
        }
    }

    fn amount_to_decimal(&self, sat: &BigUint) -> String {
        let divisor = BigUint::from(10u32).pow(self.decimals);
        let integer = sat / &divisor;
        let fraction = sat % &divisor;

        let mut fraction = fraction.to_string();
        while (fraction.len() as u32) < self.decimals {
            fraction.insert(0, '0');
        }
        while fraction.ends_with('0') {
            fraction.pop();
        }

        if fraction.is_empty() {
            integer.to_string()
        } else {
            format!("{integer}.{fraction}")
        }
    }
}
