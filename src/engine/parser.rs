use crate::types::{RuleChain, RuleError, RuleNode};

/// 规则链定义的编解码
pub trait Parser: Send + Sync {
    fn decode_rule_chain(&self, bytes: &[u8]) -> Result<RuleChain, RuleError>;
    fn encode_rule_chain(&self, def: &RuleChain) -> Result<Vec<u8>, RuleError>;
    fn decode_rule_node(&self, bytes: &[u8]) -> Result<RuleNode, RuleError>;
    fn encode_rule_node(&self, def: &RuleNode) -> Result<Vec<u8>, RuleError>;
}

/// JSON 格式
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonParser;

impl Parser for JsonParser {
    fn decode_rule_chain(&self, bytes: &[u8]) -> Result<RuleChain, RuleError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn encode_rule_chain(&self, def: &RuleChain) -> Result<Vec<u8>, RuleError> {
        Ok(serde_json::to_vec_pretty(def)?)
    }

    fn decode_rule_node(&self, bytes: &[u8]) -> Result<RuleNode, RuleError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn encode_rule_node(&self, def: &RuleNode) -> Result<Vec<u8>, RuleError> {
        Ok(serde_json::to_vec(def)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn node_definition_round_trips() {
        let raw = br#"{"id":"s1","type_name":"jsFilter","debug_mode":true,"config":{"js_script":"return true;"}}"#;
        let def = JsonParser.decode_rule_node(raw).unwrap();
        assert_eq!(def.type_name, "jsFilter");
        let again = JsonParser
            .decode_rule_node(&JsonParser.encode_rule_node(&def).unwrap())
            .unwrap();
        assert_eq!(def, again);
    }

    #[test]
    fn chain_defaults_entry_to_first_node() {
        let raw = br#"{"id":"c1","nodes":[{"id":"a","type_name":"log"},{"id":"b","type_name":"log"}]}"#;
        let def = JsonParser.decode_rule_chain(raw).unwrap();
        assert_eq!(def.entry_id(), Some("a"));
        assert!(def.connections.is_empty());
        assert!(matches!(
            JsonParser.decode_rule_chain(b"{"),
            Err(RuleError::ParseError(_))
        ));
    }
}
