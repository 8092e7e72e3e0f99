//! The output of one assembly block (§3 "Function").

use std::collections::HashMap;

/// Everything the fixup pass needs to splice one `GLOBAL_ASM`/`INCLUDE_ASM` block's bytes,
/// symbols, and relocations back into the compiler's object.
#[derive(Debug, Clone, Default)]
pub struct Function {
    pub text_glabels: Vec<String>,
    /// Raw assembly lines destined for any section but `.late_rodata`, in source order.
    pub asm_conts: Vec<String>,
    /// Sentinel bytes used as haystacks to relocate the reserved `.late_rodata` span once the
    /// assembled object exists (§4.E step 4).
    pub late_rodata_dummy_bytes: Vec<[u8; 4]>,
    /// Byte count of jump-table-style `.late_rodata` reserved via the switch-statement trick.
    pub jtbl_rodata_size: usize,
    /// `.late_rodata` lines, each `.double` bracketed by explicit `.align 0`/`.align 2` guards.
    pub late_rodata_asm_conts: Vec<String>,
    /// Human-readable provenance, quoted in error messages.
    pub fn_desc: String,
    /// Per-section `(placeholder_name, size)`, keyed by section name (`.rodata`/`.data`/`.bss`
    /// only — `.text` is tracked separately in [`Function::text_segments`] since one block's
    /// instructions may be split across several consecutively-compiled placeholder functions).
    pub data: HashMap<String, (String, usize)>,
    /// `(placeholder_function_name, reserved_byte_size)` for every placeholder function this
    /// block's `.text` content was split across, in emission order. A block under the large-
    /// function threshold has exactly one entry.
    pub text_segments: Vec<(String, usize)>,
}

impl Function {
    pub fn new(fn_desc: String) -> Function {
        Function { fn_desc, ..Default::default() }
    }
}
