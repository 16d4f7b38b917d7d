use super::{Id, ID_LENGTH};

/// Announce tokens are the leading bytes of the infohash, so checking one needs no state.
pub fn announce_token(info_hash: &Id, length: usize) -> &[u8] {
    &info_hash.0[..length.min(ID_LENGTH)]
}

pub fn check_token(token: &[u8], info_hash: &Id, length: usize) -> bool {
    token == announce_token(info_hash, length)
}

#[cfg(test)]
mod test {
    use super::{announce_token, check_token};
    use crate::dht::Id;

    #[test]
    fn test_token_roundtrip() {
        let hash = Id::random();
        let token = announce_token(&hash, 2);
        assert_eq!(token, &hash.0[..2]);
        assert!(check_token(token, &hash, 2));

        let mut other = token.to_vec();
        other[1] ^= 1;
        assert!(!check_token(&other, &hash, 2));
        assert!(!check_token(&hash.0[..3], &hash, 2));
        assert!(!check_token(&[], &hash, 2));
    }
}
