//! Process-wide counters and per-language code generation (§4.B "GlobalState").
//!
//! One instance is threaded explicitly through a single preprocess invocation — kept as an
//! ordinary value rather than ambient/global state so repeated invocations stay deterministic
//! (§9 "GlobalState as process-wide counter").

/// Instruction-budget thresholds derived from the optimization level, framepointer flag, and
/// `-KPIC`, plus the language mode and name/value counters used while generating placeholder
/// stub code.
#[derive(Debug, Clone)]
pub struct GlobalState {
    pub min_instr_count: usize,
    pub skip_instr_count: usize,
    pub use_jtbl_for_rodata: bool,
    pub prelude_if_late_rodata: usize,
    pub mips1: bool,
    pub pascal: bool,

    name_counter: u32,
    value_counter: u32,
    late_rodata_hex: u32,
}

impl GlobalState {
    pub fn new(
        min_instr_count: usize,
        skip_instr_count: usize,
        use_jtbl_for_rodata: bool,
        prelude_if_late_rodata: usize,
        mips1: bool,
        pascal: bool,
    ) -> GlobalState {
        GlobalState {
            min_instr_count,
            skip_instr_count,
            use_jtbl_for_rodata,
            prelude_if_late_rodata,
            mips1,
            pascal,
            name_counter: 0,
            value_counter: 0,
            late_rodata_hex: 0xE012_3456,
        }
    }

    /// Derives the instruction-budget table from the compiler options (§4.B), identical across
    /// optimization level × framepointer, adjusted for `-KPIC` and whether the jump-table trick
    /// for reserving `.late_rodata` applies.
    pub fn from_opts(opt: &str, framepointer: bool, mips1: bool, kpic: bool, pascal: bool) -> GlobalState {
        let (mut min_instr_count, mut skip_instr_count) = match (opt, framepointer) {
            ("O1" | "O2", true) => (6, 5),
            ("O1" | "O2", false) => (2, 1),
            ("O0", true) => (8, 8),
            ("O0", false) => (4, 4),
            ("g", true) => (7, 7),
            ("g", false) => (4, 4),
            ("g3", true) => (4, 4),
            ("g3", false) => (2, 2),
            _ => unreachable!("validated by Opts::validate"),
        };

        let prelude_if_late_rodata = if kpic {
            if opt == "g3" || opt == "O2" {
                3
            } else {
                min_instr_count += 3;
                skip_instr_count += 3;
                0
            }
        } else {
            0
        };

        let use_jtbl_for_rodata = matches!(opt, "O2" | "g3") && !framepointer && !kpic;

        GlobalState::new(min_instr_count, skip_instr_count, use_jtbl_for_rodata, prelude_if_late_rodata, mips1, pascal)
    }

    /// Returns the next 4-byte big-endian `.late_rodata` sentinel, advancing the counter so it
    /// never repeats and never lands on a value whose low 16 bits are zero — such a value could
    /// be re-encoded by the compiler as a bare `lui`, which would make the sentinel
    /// unrecognizable once reassembled (§4.B).
    pub fn next_late_rodata_hex(&mut self) -> [u8; 4] {
        let val = self.late_rodata_hex;
        self.late_rodata_hex = self.late_rodata_hex.wrapping_add(1);
        if self.late_rodata_hex & 0xffff == 0 {
            self.late_rodata_hex = self.late_rodata_hex.wrapping_add(1);
        }
        val.to_be_bytes()
    }

    /// Returns a fresh `_asmpp_<category><N>` placeholder identifier.
    pub fn make_name(&mut self, category: &str) -> String {
        self.name_counter += 1;
        format!("_asmpp_{}{}", category, self.name_counter)
    }

    /// Opening line(s) of a placeholder function/procedure in the host language.
    pub fn func_prologue(&self, name: &str) -> Vec<String> {
        if self.pascal {
            vec![
                format!("procedure {}();", name),
                "var".to_string(),
                "  pi: ^longint;".to_string(),
                "  pf: ^single;".to_string(),
                "  pd: ^double;".to_string(),
                "  vi: longint;".to_string(),
                "  vf: single;".to_string(),
                "  vd: double;".to_string(),
                "begin".to_string(),
                "  vi := vi;".to_string(),
                "  vf := vf;".to_string(),
                "  vd := vd;".to_string(),
            ]
        } else {
            vec![format!("void {}(void) {{", name)]
        }
    }

    pub fn func_epilogue(&self) -> Vec<String> {
        if self.pascal {
            vec!["end;".to_string()]
        } else {
            vec!["}".to_string()]
        }
    }

    /// A Pascal statement that writes `value` through a pointer typed by `kind` (`"i"`, `"f"`,
    /// or `"d"`), at a low-memory address that cycles so successive assignments don't alias.
    pub fn pascal_assignment(&mut self, kind: &str, value: &str) -> String {
        self.value_counter += 1;
        let addr = (8 * self.value_counter) & 0x7FFF;
        format!("v{kind} := p{kind}({addr}); v{kind}^ := {value};", kind = kind, addr = addr, value = value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn late_rodata_hex_skips_zero_low_half() {
        let mut state = GlobalState::new(2, 1, false, 0, false, false);
        state.late_rodata_hex = 0xE0FF_FFFF;
        let first = state.next_late_rodata_hex();
        assert_eq!(first, 0xE0FF_FFFFu32.to_be_bytes());
        // Counter was about to cross into 0xE100_0000 (low 16 bits zero); must be nudged past it.
        assert_ne!(state.late_rodata_hex & 0xffff, 0);
    }

    #[test]
    fn make_name_increments() {
        let mut state = GlobalState::new(2, 1, false, 0, false, false);
        assert_eq!(state.make_name("func"), "_asmpp_func1");
        assert_eq!(state.make_name("func"), "_asmpp_func2");
        assert_eq!(state.make_name("data"), "_asmpp_data3");
    }

    #[test]
    fn from_opts_o1_no_framepointer() {
        let state = GlobalState::from_opts("O1", false, false, false, false);
        assert_eq!(state.min_instr_count, 2);
        assert_eq!(state.skip_instr_count, 1);
        assert!(!state.use_jtbl_for_rodata);
    }

    #[test]
    fn from_opts_o2_enables_jtbl_trick() {
        let state = GlobalState::from_opts("O2", false, false, false, false);
        assert!(state.use_jtbl_for_rodata);
        let state = GlobalState::from_opts("O2", true, false, false, false);
        assert!(!state.use_jtbl_for_rodata);
    }

    #[test]
    fn from_opts_kpic_adjusts_budget() {
        let state = GlobalState::from_opts("O1", false, false, true, false);
        assert_eq!(state.min_instr_count, 5);
        assert_eq!(state.skip_instr_count, 4);
        assert_eq!(state.prelude_if_late_rodata, 0);

        let state = GlobalState::from_opts("O2", false, false, true, false);
        assert_eq!(state.prelude_if_late_rodata, 3);
    }

    #[test]
    fn pascal_assignment_cycles_addresses() {
        let mut state = GlobalState::new(2, 1, false, 0, false, true);
        let s1 = state.pascal_assignment("f", "1.0");
        assert_eq!(s1, "vf := pf(8); vf^ := 1.0;");
        let s2 = state.pascal_assignment("d", "2.0");
        assert_eq!(s2, "vd := pd(16); vd^ := 2.0;");
    }
}
