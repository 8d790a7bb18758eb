//! Snapshot tests for instruction disassembly.

use kosmos_protocol::{
    KbdCommand, KbdInstruction, MarkerOps, ModuleStatus, OptEmuInstruction, PesInstruction,
    PesStatus, opt_cmd, pes,
};

mod pes_snapshots {
    use super::*;
    use insta::assert_snapshot;

    #[test]
    fn test_delay() {
        let instr = PesInstruction::Delay {
            exponent: 0,
            mantissa: 4,
            actions: 0x001,
        };
        assert_snapshot!(instr.to_string(), @"DELAY ticks=400 mantissa=0x004 exponent=0 actions=0x001");
    }

    #[test]
    fn test_marker() {
        let instr = PesInstruction::Marker {
            ops: MarkerOps::SAVE_GLOBAL | MarkerOps::STOPWATCH_1_GO,
        };
        assert_snapshot!(instr.to_string(), @"MARKER ops=0x081");
    }

    #[test]
    fn test_program_listing() -> Result<(), Box<dyn std::error::Error>> {
        let program = pes::encode_program(&pes::encode_delay(15, 0x002)?)?;
        assert_snapshot!(
            pes::disassemble(&program).replace('\n', "|"),
            @"0000: 0x41000000 SUBDELAY ticks=10 nibble=1 actions=0x000|0001: 0x40000002 SUBDELAY ticks=5 nibble=0 actions=0x002"
        );
        Ok(())
    }
}

mod kbd_snapshots {
    use super::*;
    use insta::assert_snapshot;

    #[test]
    fn test_update_send() {
        let instr = KbdInstruction::new(KbdCommand::UpdateSend, 1, 0x07, 0b0000_0100);
        assert_snapshot!(instr.to_string(), @"UPDATE_SEND bank=1 addr=0x07 lane=0b00000100");
    }
}

mod optemu_snapshots {
    use super::*;
    use insta::assert_snapshot;

    #[test]
    fn test_raw() {
        let instr = OptEmuInstruction::raw(opt_cmd::DX, 0xFFFF).with_send(true);
        assert_snapshot!(instr.to_string(), @"RAW: UP_SEND, CMD=0x01:    DX, VAL=0xffff:    -1");
    }

    #[test]
    fn test_compressed() -> Result<(), Box<dyn std::error::Error>> {
        let instr = OptEmuInstruction::compressed(1, -2, false, 0, 3)?;
        assert_snapshot!(instr.to_string(), @"CMP: dX=  1, dY= -2, lift=0, skip=0, repeat=3");
        Ok(())
    }
}

mod status_snapshots {
    use super::*;
    use insta::assert_snapshot;

    #[test]
    fn test_pes_status() {
        let status = ModuleStatus::Pes(PesStatus {
            fifo_count: 3,
            buffer_count: 0,
            overrun: false,
            underrun: true,
            soft_reset: false,
            bad_opcode: false,
        });
        assert_snapshot!(status.to_string(), @"fifo=3 buffer=0 overrun=false underrun=true soft_reset=false bad_opcode=false");
    }
}
