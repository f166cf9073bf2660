//! Fuzz target for B-tree node decoding.
//!
//! `Node::decode` must never panic, and a decoded node must encode back to
//! bytes that decode to the same keys and children.

#![no_main]

use libfuzzer_sys::fuzz_target;

use tarn_store::{Node, NodeRef};

fuzz_target!(|data: &[u8]| {
    let Ok(node) = Node::decode(data) else {
        return;
    };
    let bytes = node.encode().expect("decoded nodes only hold stored children");
    assert_eq!(bytes.len(), node.encoded_size());

    let again = Node::decode(&bytes).expect("re-encoded node must decode");
    assert_eq!(again.is_leaf(), node.is_leaf());
    assert_eq!(again.keys(), node.keys(), "keys changed on round trip");
    assert_eq!(children(&again), children(&node), "children changed on round trip");
});

fn children(node: &Node) -> Vec<u32> {
    node.children()
        .iter()
        .map(|child| match child {
            NodeRef::Stored(adr) => *adr,
            _ => panic!("decoded child is not stored"),
        })
        .collect()
}
