#![no_main]

use libfuzzer_sys::fuzz_target;

use keyrack_core::PasswordHistory;

fuzz_target!(|data: &[u8]| {
    if data.len() > 64 * 1024 {
        return;
    }
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(history) = PasswordHistory::decode(text) {
        // Whatever decodes must re-encode to the same string.
        assert_eq!(PasswordHistory::decode(&history.encode()), Ok(history));
    }
});
