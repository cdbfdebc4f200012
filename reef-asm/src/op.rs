//! The opcode table.
//!
//! Raw values within the core plane are the Wasm one-byte opcodes; prefixed
//! planes keep their LEB-encoded sub-opcode values. See `macros.rs` for what
//! gets generated from this table.

define_ops! {
    // Core one-byte plane.
    0x0000 => {
        0x00 Unreachable "unreachable"
        0x01 Nop "nop"
        0x02 Block "block"
        0x03 Loop "loop"
        0x04 If "if"
        0x05 Else "else"
        0x08 Throw "throw"
        0x0A ThrowRef "throw_ref"
        0x0B End "end"
        0x0C Br "br"
        0x0D BrIf "br_if"
        0x0E BrTable "br_table"
        0x0F Return "return"
        0x10 Call "call"
        0x11 CallIndirect "call_indirect"
        0x12 ReturnCall "return_call"
        0x13 ReturnCallIndirect "return_call_indirect"
        0x14 CallRef "call_ref"
        0x15 ReturnCallRef "return_call_ref"
        0x1A Drop "drop"
        0x1B Select "select"
        0x1C SelectT "select t"
        0x1F TryTable "try_table"
        0x20 LocalGet "local.get"
        0x21 LocalSet "local.set"
        0x22 LocalTee "local.tee"
        0x23 GlobalGet "global.get"
        0x24 GlobalSet "global.set"
        0x25 TableGet "table.get"
        0x26 TableSet "table.set"
        0x28 I32Load "i32.load"
        0x29 I64Load "i64.load"
        0x2A F32Load "f32.load"
        0x2B F64Load "f64.load"
        0x2C I32Load8S "i32.load8_s"
        0x2D I32Load8U "i32.load8_u"
        0x2E I32Load16S "i32.load16_s"
        0x2F I32Load16U "i32.load16_u"
        0x30 I64Load8S "i64.load8_s"
        0x31 I64Load8U "i64.load8_u"
        0x32 I64Load16S "i64.load16_s"
        0x33 I64Load16U "i64.load16_u"
        0x34 I64Load32S "i64.load32_s"
        0x35 I64Load32U "i64.load32_u"
        0x36 I32Store "i32.store"
        0x37 I64Store "i64.store"
        0x38 F32Store "f32.store"
        0x39 F64Store "f64.store"
        0x3A I32Store8 "i32.store8"
        0x3B I32Store16 "i32.store16"
        0x3C I64Store8 "i64.store8"
        0x3D I64Store16 "i64.store16"
        0x3E I64Store32 "i64.store32"
        0x3F MemorySize "memory.size"
        0x40 MemoryGrow "memory.grow"
        0x41 I32Const "i32.const"
        0x42 I64Const "i64.const"
        0x43 F32Const "f32.const"
        0x44 F64Const "f64.const"
        0x45 I32Eqz "i32.eqz"
        0x46 I32Eq "i32.eq"
        0x47 I32Ne "i32.ne"
        0x48 I32LtS "i32.lt_s"
        0x49 I32LtU "i32.lt_u"
        0x4A I32GtS "i32.gt_s"
        0x4B I32GtU "i32.gt_u"
        0x4C I32LeS "i32.le_s"
        0x4D I32LeU "i32.le_u"
        0x4E I32GeS "i32.ge_s"
        0x4F I32GeU "i32.ge_u"
        0x50 I64Eqz "i64.eqz"
        0x51 I64Eq "i64.eq"
        0x52 I64Ne "i64.ne"
        0x53 I64LtS "i64.lt_s"
        0x54 I64LtU "i64.lt_u"
        0x55 I64GtS "i64.gt_s"
        0x56 I64GtU "i64.gt_u"
        0x57 I64LeS "i64.le_s"
        0x58 I64LeU "i64.le_u"
        0x59 I64GeS "i64.ge_s"
        0x5A I64GeU "i64.ge_u"
        0x5B F32Eq "f32.eq"
        0x5C F32Ne "f32.ne"
        0x5D F32Lt "f32.lt"
        0x5E F32Gt "f32.gt"
        0x5F F32Le "f32.le"
        0x60 F32Ge "f32.ge"
        0x61 F64Eq "f64.eq"
        0x62 F64Ne "f64.ne"
        0x63 F64Lt "f64.lt"
        0x64 F64Gt "f64.gt"
        0x65 F64Le "f64.le"
        0x66 F64Ge "f64.ge"
        0x67 I32Clz "i32.clz"
        0x68 I32Ctz "i32.ctz"
        0x69 I32Popcnt "i32.popcnt"
        0x6A I32Add "i32.add"
        0x6B I32Sub "i32.sub"
        0x6C I32Mul "i32.mul"
        0x6D I32DivS "i32.div_s"
        0x6E I32DivU "i32.div_u"
        0x6F I32RemS "i32.rem_s"
        0x70 I32RemU "i32.rem_u"
        0x71 I32And "i32.and"
        0x72 I32Or "i32.or"
        0x73 I32Xor "i32.xor"
        0x74 I32Shl "i32.shl"
        0x75 I32ShrS "i32.shr_s"
        0x76 I32ShrU "i32.shr_u"
        0x77 I32Rotl "i32.rotl"
        0x78 I32Rotr "i32.rotr"
        0x79 I64Clz "i64.clz"
        0x7A I64Ctz "i64.ctz"
        0x7B I64Popcnt "i64.popcnt"
        0x7C I64Add "i64.add"
        0x7D I64Sub "i64.sub"
        0x7E I64Mul "i64.mul"
        0x7F I64DivS "i64.div_s"
        0x80 I64DivU "i64.div_u"
        0x81 I64RemS "i64.rem_s"
        0x82 I64RemU "i64.rem_u"
        0x83 I64And "i64.and"
        0x84 I64Or "i64.or"
        0x85 I64Xor "i64.xor"
        0x86 I64Shl "i64.shl"
        0x87 I64ShrS "i64.shr_s"
        0x88 I64ShrU "i64.shr_u"
        0x89 I64Rotl "i64.rotl"
        0x8A I64Rotr "i64.rotr"
        0x8B F32Abs "f32.abs"
        0x8C F32Neg "f32.neg"
        0x8D F32Ceil "f32.ceil"
        0x8E F32Floor "f32.floor"
        0x8F F32Trunc "f32.trunc"
        0x90 F32Nearest "f32.nearest"
        0x91 F32Sqrt "f32.sqrt"
        0x92 F32Add "f32.add"
        0x93 F32Sub "f32.sub"
        0x94 F32Mul "f32.mul"
        0x95 F32Div "f32.div"
        0x96 F32Min "f32.min"
        0x97 F32Max "f32.max"
        0x98 F32Copysign "f32.copysign"
        0x99 F64Abs "f64.abs"
        0x9A F64Neg "f64.neg"
        0x9B F64Ceil "f64.ceil"
        0x9C F64Floor "f64.floor"
        0x9D F64Trunc "f64.trunc"
        0x9E F64Nearest "f64.nearest"
        0x9F F64Sqrt "f64.sqrt"
        0xA0 F64Add "f64.add"
        0xA1 F64Sub "f64.sub"
        0xA2 F64Mul "f64.mul"
        0xA3 F64Div "f64.div"
        0xA4 F64Min "f64.min"
        0xA5 F64Max "f64.max"
        0xA6 F64Copysign "f64.copysign"
        0xA7 I32WrapI64 "i32.wrap_i64"
        0xA8 I32TruncF32S "i32.trunc_f32_s"
        0xA9 I32TruncF32U "i32.trunc_f32_u"
        0xAA I32TruncF64S "i32.trunc_f64_s"
        0xAB I32TruncF64U "i32.trunc_f64_u"
        0xAC I64ExtendI32S "i64.extend_i32_s"
        0xAD I64ExtendI32U "i64.extend_i32_u"
        0xAE I64TruncF32S "i64.trunc_f32_s"
        0xAF I64TruncF32U "i64.trunc_f32_u"
        0xB0 I64TruncF64S "i64.trunc_f64_s"
        0xB1 I64TruncF64U "i64.trunc_f64_u"
        0xB2 F32ConvertI32S "f32.convert_i32_s"
        0xB3 F32ConvertI32U "f32.convert_i32_u"
        0xB4 F32ConvertI64S "f32.convert_i64_s"
        0xB5 F32ConvertI64U "f32.convert_i64_u"
        0xB6 F32DemoteF64 "f32.demote_f64"
        0xB7 F64ConvertI32S "f64.convert_i32_s"
        0xB8 F64ConvertI32U "f64.convert_i32_u"
        0xB9 F64ConvertI64S "f64.convert_i64_s"
        0xBA F64ConvertI64U "f64.convert_i64_u"
        0xBB F64PromoteF32 "f64.promote_f32"
        0xBC I32ReinterpretF32 "i32.reinterpret_f32"
        0xBD I64ReinterpretF64 "i64.reinterpret_f64"
        0xBE F32ReinterpretI32 "f32.reinterpret_i32"
        0xBF F64ReinterpretI64 "f64.reinterpret_i64"
        0xC0 I32Extend8S "i32.extend8_s"
        0xC1 I32Extend16S "i32.extend16_s"
        0xC2 I64Extend8S "i64.extend8_s"
        0xC3 I64Extend16S "i64.extend16_s"
        0xC4 I64Extend32S "i64.extend32_s"
        0xD0 RefNull "ref.null"
        0xD1 RefIsNull "ref.is_null"
        0xD2 RefFunc "ref.func"
        0xD3 RefEq "ref.eq"
        0xD4 RefAsNonNull "ref.as_non_null"
        0xD5 BrOnNull "br_on_null"
        0xD6 BrOnNonNull "br_on_non_null"
    }
    // 0xFC miscellaneous plane.
    0x0100 => {
        0x00 I32TruncSatF32S "i32.trunc_sat_f32_s"
        0x01 I32TruncSatF32U "i32.trunc_sat_f32_u"
        0x02 I32TruncSatF64S "i32.trunc_sat_f64_s"
        0x03 I32TruncSatF64U "i32.trunc_sat_f64_u"
        0x04 I64TruncSatF32S "i64.trunc_sat_f32_s"
        0x05 I64TruncSatF32U "i64.trunc_sat_f32_u"
        0x06 I64TruncSatF64S "i64.trunc_sat_f64_s"
        0x07 I64TruncSatF64U "i64.trunc_sat_f64_u"
        0x08 MemoryInit "memory.init"
        0x09 DataDrop "data.drop"
        0x0A MemoryCopy "memory.copy"
        0x0B MemoryFill "memory.fill"
        0x0C TableInit "table.init"
        0x0D ElemDrop "elem.drop"
        0x0E TableCopy "table.copy"
        0x0F TableGrow "table.grow"
        0x10 TableSize "table.size"
        0x11 TableFill "table.fill"
        0x13 I64Add128 "i64.add128"
        0x14 I64Sub128 "i64.sub128"
        0x15 I64MulWideS "i64.mul_wide_s"
        0x16 I64MulWideU "i64.mul_wide_u"
    }
    // 0xFD vector plane.
    0x0200 => {
        0x00 V128Load "v128.load"
        0x01 V128Load8x8S "v128.load8x8_s"
        0x02 V128Load8x8U "v128.load8x8_u"
        0x03 V128Load16x4S "v128.load16x4_s"
        0x04 V128Load16x4U "v128.load16x4_u"
        0x05 V128Load32x2S "v128.load32x2_s"
        0x06 V128Load32x2U "v128.load32x2_u"
        0x07 V128Load8Splat "v128.load8_splat"
        0x08 V128Load16Splat "v128.load16_splat"
        0x09 V128Load32Splat "v128.load32_splat"
        0x0A V128Load64Splat "v128.load64_splat"
        0x0B V128Store "v128.store"
        0x0C V128Const "v128.const"
        0x0D I8x16Shuffle "i8x16.shuffle"
        0x0E I8x16Swizzle "i8x16.swizzle"
        0x0F I8x16Splat "i8x16.splat"
        0x10 I16x8Splat "i16x8.splat"
        0x11 I32x4Splat "i32x4.splat"
        0x12 I64x2Splat "i64x2.splat"
        0x13 F32x4Splat "f32x4.splat"
        0x14 F64x2Splat "f64x2.splat"
        0x15 I8x16ExtractLaneS "i8x16.extract_lane_s"
        0x16 I8x16ExtractLaneU "i8x16.extract_lane_u"
        0x17 I8x16ReplaceLane "i8x16.replace_lane"
        0x18 I16x8ExtractLaneS "i16x8.extract_lane_s"
        0x19 I16x8ExtractLaneU "i16x8.extract_lane_u"
        0x1A I16x8ReplaceLane "i16x8.replace_lane"
        0x1B I32x4ExtractLane "i32x4.extract_lane"
        0x1C I32x4ReplaceLane "i32x4.replace_lane"
        0x1D I64x2ExtractLane "i64x2.extract_lane"
        0x1E I64x2ReplaceLane "i64x2.replace_lane"
        0x1F F32x4ExtractLane "f32x4.extract_lane"
        0x20 F32x4ReplaceLane "f32x4.replace_lane"
        0x21 F64x2ExtractLane "f64x2.extract_lane"
        0x22 F64x2ReplaceLane "f64x2.replace_lane"
        0x23 I8x16Eq "i8x16.eq"
        0x24 I8x16Ne "i8x16.ne"
        0x25 I8x16LtS "i8x16.lt_s"
        0x26 I8x16LtU "i8x16.lt_u"
        0x27 I8x16GtS "i8x16.gt_s"
        0x28 I8x16GtU "i8x16.gt_u"
        0x29 I8x16LeS "i8x16.le_s"
        0x2A I8x16LeU "i8x16.le_u"
        0x2B I8x16GeS "i8x16.ge_s"
        0x2C I8x16GeU "i8x16.ge_u"
        0x2D I16x8Eq "i16x8.eq"
        0x2E I16x8Ne "i16x8.ne"
        0x2F I16x8LtS "i16x8.lt_s"
        0x30 I16x8LtU "i16x8.lt_u"
        0x31 I16x8GtS "i16x8.gt_s"
        0x32 I16x8GtU "i16x8.gt_u"
        0x33 I16x8LeS "i16x8.le_s"
        0x34 I16x8LeU "i16x8.le_u"
        0x35 I16x8GeS "i16x8.ge_s"
        0x36 I16x8GeU "i16x8.ge_u"
        0x37 I32x4Eq "i32x4.eq"
        0x38 I32x4Ne "i32x4.ne"
        0x39 I32x4LtS "i32x4.lt_s"
        0x3A I32x4LtU "i32x4.lt_u"
        0x3B I32x4GtS "i32x4.gt_s"
        0x3C I32x4GtU "i32x4.gt_u"
        0x3D I32x4LeS "i32x4.le_s"
        0x3E I32x4LeU "i32x4.le_u"
        0x3F I32x4GeS "i32x4.ge_s"
        0x40 I32x4GeU "i32x4.ge_u"
        0x41 F32x4Eq "f32x4.eq"
        0x42 F32x4Ne "f32x4.ne"
        0x43 F32x4Lt "f32x4.lt"
        0x44 F32x4Gt "f32x4.gt"
        0x45 F32x4Le "f32x4.le"
        0x46 F32x4Ge "f32x4.ge"
        0x47 F64x2Eq "f64x2.eq"
        0x48 F64x2Ne "f64x2.ne"
        0x49 F64x2Lt "f64x2.lt"
        0x4A F64x2Gt "f64x2.gt"
        0x4B F64x2Le "f64x2.le"
        0x4C F64x2Ge "f64x2.ge"
        0x4D V128Not "v128.not"
        0x4E V128And "v128.and"
        0x4F V128AndNot "v128.andnot"
        0x50 V128Or "v128.or"
        0x51 V128Xor "v128.xor"
        0x52 V128Bitselect "v128.bitselect"
        0x53 V128AnyTrue "v128.any_true"
        0x54 V128Load8Lane "v128.load8_lane"
        0x55 V128Load16Lane "v128.load16_lane"
        0x56 V128Load32Lane "v128.load32_lane"
        0x57 V128Load64Lane "v128.load64_lane"
        0x58 V128Store8Lane "v128.store8_lane"
        0x59 V128Store16Lane "v128.store16_lane"
        0x5A V128Store32Lane "v128.store32_lane"
        0x5B V128Store64Lane "v128.store64_lane"
        0x5C V128Load32Zero "v128.load32_zero"
        0x5D V128Load64Zero "v128.load64_zero"
        0x5E F32x4DemoteF64x2Zero "f32x4.demote_f64x2_zero"
        0x5F F64x2PromoteLowF32x4 "f64x2.promote_low_f32x4"
        0x60 I8x16Abs "i8x16.abs"
        0x61 I8x16Neg "i8x16.neg"
        0x62 I8x16Popcnt "i8x16.popcnt"
        0x63 I8x16AllTrue "i8x16.all_true"
        0x64 I8x16Bitmask "i8x16.bitmask"
        0x65 I8x16NarrowI16x8S "i8x16.narrow_i16x8_s"
        0x66 I8x16NarrowI16x8U "i8x16.narrow_i16x8_u"
        0x67 F32x4Ceil "f32x4.ceil"
        0x68 F32x4Floor "f32x4.floor"
        0x69 F32x4Trunc "f32x4.trunc"
        0x6A F32x4Nearest "f32x4.nearest"
        0x6B I8x16Shl "i8x16.shl"
        0x6C I8x16ShrS "i8x16.shr_s"
        0x6D I8x16ShrU "i8x16.shr_u"
        0x6E I8x16Add "i8x16.add"
        0x6F I8x16AddSatS "i8x16.add_sat_s"
        0x70 I8x16AddSatU "i8x16.add_sat_u"
        0x71 I8x16Sub "i8x16.sub"
        0x72 I8x16SubSatS "i8x16.sub_sat_s"
        0x73 I8x16SubSatU "i8x16.sub_sat_u"
        0x74 F64x2Ceil "f64x2.ceil"
        0x75 F64x2Floor "f64x2.floor"
        0x76 I8x16MinS "i8x16.min_s"
        0x77 I8x16MinU "i8x16.min_u"
        0x78 I8x16MaxS "i8x16.max_s"
        0x79 I8x16MaxU "i8x16.max_u"
        0x7A F64x2Trunc "f64x2.trunc"
        0x7B I8x16AvgrU "i8x16.avgr_u"
        0x7C I16x8ExtAddPairwiseI8x16S "i16x8.extadd_pairwise_i8x16_s"
        0x7D I16x8ExtAddPairwiseI8x16U "i16x8.extadd_pairwise_i8x16_u"
        0x7E I32x4ExtAddPairwiseI16x8S "i32x4.extadd_pairwise_i16x8_s"
        0x7F I32x4ExtAddPairwiseI16x8U "i32x4.extadd_pairwise_i16x8_u"
        0x80 I16x8Abs "i16x8.abs"
        0x81 I16x8Neg "i16x8.neg"
        0x82 I16x8Q15MulrSatS "i16x8.q15mulr_sat_s"
        0x83 I16x8AllTrue "i16x8.all_true"
        0x84 I16x8Bitmask "i16x8.bitmask"
        0x85 I16x8NarrowI32x4S "i16x8.narrow_i32x4_s"
        0x86 I16x8NarrowI32x4U "i16x8.narrow_i32x4_u"
        0x87 I16x8ExtendLowI8x16S "i16x8.extend_low_i8x16_s"
        0x88 I16x8ExtendHighI8x16S "i16x8.extend_high_i8x16_s"
        0x89 I16x8ExtendLowI8x16U "i16x8.extend_low_i8x16_u"
        0x8A I16x8ExtendHighI8x16U "i16x8.extend_high_i8x16_u"
        0x8B I16x8Shl "i16x8.shl"
        0x8C I16x8ShrS "i16x8.shr_s"
        0x8D I16x8ShrU "i16x8.shr_u"
        0x8E I16x8Add "i16x8.add"
        0x8F I16x8AddSatS "i16x8.add_sat_s"
        0x90 I16x8AddSatU "i16x8.add_sat_u"
        0x91 I16x8Sub "i16x8.sub"
        0x92 I16x8SubSatS "i16x8.sub_sat_s"
        0x93 I16x8SubSatU "i16x8.sub_sat_u"
        0x94 F64x2Nearest "f64x2.nearest"
        0x95 I16x8Mul "i16x8.mul"
        0x96 I16x8MinS "i16x8.min_s"
        0x97 I16x8MinU "i16x8.min_u"
        0x98 I16x8MaxS "i16x8.max_s"
        0x99 I16x8MaxU "i16x8.max_u"
        0x9B I16x8AvgrU "i16x8.avgr_u"
        0x9C I16x8ExtMulLowI8x16S "i16x8.extmul_low_i8x16_s"
        0x9D I16x8ExtMulHighI8x16S "i16x8.extmul_high_i8x16_s"
        0x9E I16x8ExtMulLowI8x16U "i16x8.extmul_low_i8x16_u"
        0x9F I16x8ExtMulHighI8x16U "i16x8.extmul_high_i8x16_u"
        0xA0 I32x4Abs "i32x4.abs"
        0xA1 I32x4Neg "i32x4.neg"
        0xA3 I32x4AllTrue "i32x4.all_true"
        0xA4 I32x4Bitmask "i32x4.bitmask"
        0xA7 I32x4ExtendLowI16x8S "i32x4.extend_low_i16x8_s"
        0xA8 I32x4ExtendHighI16x8S "i32x4.extend_high_i16x8_s"
        0xA9 I32x4ExtendLowI16x8U "i32x4.extend_low_i16x8_u"
        0xAA I32x4ExtendHighI16x8U "i32x4.extend_high_i16x8_u"
        0xAB I32x4Shl "i32x4.shl"
        0xAC I32x4ShrS "i32x4.shr_s"
        0xAD I32x4ShrU "i32x4.shr_u"
        0xAE I32x4Add "i32x4.add"
        0xB1 I32x4Sub "i32x4.sub"
        0xB5 I32x4Mul "i32x4.mul"
        0xB6 I32x4MinS "i32x4.min_s"
        0xB7 I32x4MinU "i32x4.min_u"
        0xB8 I32x4MaxS "i32x4.max_s"
        0xB9 I32x4MaxU "i32x4.max_u"
        0xBA I32x4DotI16x8S "i32x4.dot_i16x8_s"
        0xBC I32x4ExtMulLowI16x8S "i32x4.extmul_low_i16x8_s"
        0xBD I32x4ExtMulHighI16x8S "i32x4.extmul_high_i16x8_s"
        0xBE I32x4ExtMulLowI16x8U "i32x4.extmul_low_i16x8_u"
        0xBF I32x4ExtMulHighI16x8U "i32x4.extmul_high_i16x8_u"
        0xC0 I64x2Abs "i64x2.abs"
        0xC1 I64x2Neg "i64x2.neg"
        0xC3 I64x2AllTrue "i64x2.all_true"
        0xC4 I64x2Bitmask "i64x2.bitmask"
        0xC7 I64x2ExtendLowI32x4S "i64x2.extend_low_i32x4_s"
        0xC8 I64x2ExtendHighI32x4S "i64x2.extend_high_i32x4_s"
        0xC9 I64x2ExtendLowI32x4U "i64x2.extend_low_i32x4_u"
        0xCA I64x2ExtendHighI32x4U "i64x2.extend_high_i32x4_u"
        0xCB I64x2Shl "i64x2.shl"
        0xCC I64x2ShrS "i64x2.shr_s"
        0xCD I64x2ShrU "i64x2.shr_u"
        0xCE I64x2Add "i64x2.add"
        0xD1 I64x2Sub "i64x2.sub"
        0xD5 I64x2Mul "i64x2.mul"
        0xD6 I64x2Eq "i64x2.eq"
        0xD7 I64x2Ne "i64x2.ne"
        0xD8 I64x2LtS "i64x2.lt_s"
        0xD9 I64x2GtS "i64x2.gt_s"
        0xDA I64x2LeS "i64x2.le_s"
        0xDB I64x2GeS "i64x2.ge_s"
        0xDC I64x2ExtMulLowI32x4S "i64x2.extmul_low_i32x4_s"
        0xDD I64x2ExtMulHighI32x4S "i64x2.extmul_high_i32x4_s"
        0xDE I64x2ExtMulLowI32x4U "i64x2.extmul_low_i32x4_u"
        0xDF I64x2ExtMulHighI32x4U "i64x2.extmul_high_i32x4_u"
        0xE0 F32x4Abs "f32x4.abs"
        0xE1 F32x4Neg "f32x4.neg"
        0xE3 F32x4Sqrt "f32x4.sqrt"
        0xE4 F32x4Add "f32x4.add"
        0xE5 F32x4Sub "f32x4.sub"
        0xE6 F32x4Mul "f32x4.mul"
        0xE7 F32x4Div "f32x4.div"
        0xE8 F32x4Min "f32x4.min"
        0xE9 F32x4Max "f32x4.max"
        0xEA F32x4Pmin "f32x4.pmin"
        0xEB F32x4Pmax "f32x4.pmax"
        0xEC F64x2Abs "f64x2.abs"
        0xED F64x2Neg "f64x2.neg"
        0xEF F64x2Sqrt "f64x2.sqrt"
        0xF0 F64x2Add "f64x2.add"
        0xF1 F64x2Sub "f64x2.sub"
        0xF2 F64x2Mul "f64x2.mul"
        0xF3 F64x2Div "f64x2.div"
        0xF4 F64x2Min "f64x2.min"
        0xF5 F64x2Max "f64x2.max"
        0xF6 F64x2Pmin "f64x2.pmin"
        0xF7 F64x2Pmax "f64x2.pmax"
        0xF8 I32x4TruncSatF32x4S "i32x4.trunc_sat_f32x4_s"
        0xF9 I32x4TruncSatF32x4U "i32x4.trunc_sat_f32x4_u"
        0xFA F32x4ConvertI32x4S "f32x4.convert_i32x4_s"
        0xFB F32x4ConvertI32x4U "f32x4.convert_i32x4_u"
        0xFC I32x4TruncSatF64x2SZero "i32x4.trunc_sat_f64x2_s_zero"
        0xFD I32x4TruncSatF64x2UZero "i32x4.trunc_sat_f64x2_u_zero"
        0xFE F64x2ConvertLowI32x4S "f64x2.convert_low_i32x4_s"
        0xFF F64x2ConvertLowI32x4U "f64x2.convert_low_i32x4_u"
    }
    // 0xFE atomic plane.
    0x0400 => {
        0x00 MemoryAtomicNotify "memory.atomic.notify"
        0x01 MemoryAtomicWait32 "memory.atomic.wait32"
        0x02 MemoryAtomicWait64 "memory.atomic.wait64"
        0x03 AtomicFence "atomic.fence"
        0x10 I32AtomicLoad "i32.atomic.load"
        0x11 I64AtomicLoad "i64.atomic.load"
        0x12 I32AtomicLoad8U "i32.atomic.load8_u"
        0x13 I32AtomicLoad16U "i32.atomic.load16_u"
        0x14 I64AtomicLoad8U "i64.atomic.load8_u"
        0x15 I64AtomicLoad16U "i64.atomic.load16_u"
        0x16 I64AtomicLoad32U "i64.atomic.load32_u"
        0x17 I32AtomicStore "i32.atomic.store"
        0x18 I64AtomicStore "i64.atomic.store"
        0x19 I32AtomicStore8 "i32.atomic.store8"
        0x1A I32AtomicStore16 "i32.atomic.store16"
        0x1B I64AtomicStore8 "i64.atomic.store8"
        0x1C I64AtomicStore16 "i64.atomic.store16"
        0x1D I64AtomicStore32 "i64.atomic.store32"
        0x1E I32AtomicRmwAdd "i32.atomic.rmw.add"
        0x1F I64AtomicRmwAdd "i64.atomic.rmw.add"
        0x20 I32AtomicRmw8AddU "i32.atomic.rmw8.add_u"
        0x21 I32AtomicRmw16AddU "i32.atomic.rmw16.add_u"
        0x22 I64AtomicRmw8AddU "i64.atomic.rmw8.add_u"
        0x23 I64AtomicRmw16AddU "i64.atomic.rmw16.add_u"
        0x24 I64AtomicRmw32AddU "i64.atomic.rmw32.add_u"
        0x25 I32AtomicRmwSub "i32.atomic.rmw.sub"
        0x26 I64AtomicRmwSub "i64.atomic.rmw.sub"
        0x27 I32AtomicRmw8SubU "i32.atomic.rmw8.sub_u"
        0x28 I32AtomicRmw16SubU "i32.atomic.rmw16.sub_u"
        0x29 I64AtomicRmw8SubU "i64.atomic.rmw8.sub_u"
        0x2A I64AtomicRmw16SubU "i64.atomic.rmw16.sub_u"
        0x2B I64AtomicRmw32SubU "i64.atomic.rmw32.sub_u"
        0x2C I32AtomicRmwAnd "i32.atomic.rmw.and"
        0x2D I64AtomicRmwAnd "i64.atomic.rmw.and"
        0x2E I32AtomicRmw8AndU "i32.atomic.rmw8.and_u"
        0x2F I32AtomicRmw16AndU "i32.atomic.rmw16.and_u"
        0x30 I64AtomicRmw8AndU "i64.atomic.rmw8.and_u"
        0x31 I64AtomicRmw16AndU "i64.atomic.rmw16.and_u"
        0x32 I64AtomicRmw32AndU "i64.atomic.rmw32.and_u"
        0x33 I32AtomicRmwOr "i32.atomic.rmw.or"
        0x34 I64AtomicRmwOr "i64.atomic.rmw.or"
        0x35 I32AtomicRmw8OrU "i32.atomic.rmw8.or_u"
        0x36 I32AtomicRmw16OrU "i32.atomic.rmw16.or_u"
        0x37 I64AtomicRmw8OrU "i64.atomic.rmw8.or_u"
        0x38 I64AtomicRmw16OrU "i64.atomic.rmw16.or_u"
        0x39 I64AtomicRmw32OrU "i64.atomic.rmw32.or_u"
        0x3A I32AtomicRmwXor "i32.atomic.rmw.xor"
        0x3B I64AtomicRmwXor "i64.atomic.rmw.xor"
        0x3C I32AtomicRmw8XorU "i32.atomic.rmw8.xor_u"
        0x3D I32AtomicRmw16XorU "i32.atomic.rmw16.xor_u"
        0x3E I64AtomicRmw8XorU "i64.atomic.rmw8.xor_u"
        0x3F I64AtomicRmw16XorU "i64.atomic.rmw16.xor_u"
        0x40 I64AtomicRmw32XorU "i64.atomic.rmw32.xor_u"
        0x41 I32AtomicRmwXchg "i32.atomic.rmw.xchg"
        0x42 I64AtomicRmwXchg "i64.atomic.rmw.xchg"
        0x43 I32AtomicRmw8XchgU "i32.atomic.rmw8.xchg_u"
        0x44 I32AtomicRmw16XchgU "i32.atomic.rmw16.xchg_u"
        0x45 I64AtomicRmw8XchgU "i64.atomic.rmw8.xchg_u"
        0x46 I64AtomicRmw16XchgU "i64.atomic.rmw16.xchg_u"
        0x47 I64AtomicRmw32XchgU "i64.atomic.rmw32.xchg_u"
        0x48 I32AtomicRmwCmpxchg "i32.atomic.rmw.cmpxchg"
        0x49 I64AtomicRmwCmpxchg "i64.atomic.rmw.cmpxchg"
        0x4A I32AtomicRmw8CmpxchgU "i32.atomic.rmw8.cmpxchg_u"
        0x4B I32AtomicRmw16CmpxchgU "i32.atomic.rmw16.cmpxchg_u"
        0x4C I64AtomicRmw8CmpxchgU "i64.atomic.rmw8.cmpxchg_u"
        0x4D I64AtomicRmw16CmpxchgU "i64.atomic.rmw16.cmpxchg_u"
        0x4E I64AtomicRmw32CmpxchgU "i64.atomic.rmw32.cmpxchg_u"
    }
    // 0xFB GC plane.
    0x0500 => {
        0x00 StructNew "struct.new"
        0x01 StructNewDefault "struct.new_default"
        0x02 StructGet "struct.get"
        0x03 StructGetS "struct.get_s"
        0x04 StructGetU "struct.get_u"
        0x05 StructSet "struct.set"
        0x06 ArrayNew "array.new"
        0x07 ArrayNewDefault "array.new_default"
        0x08 ArrayNewFixed "array.new_fixed"
        0x09 ArrayNewData "array.new_data"
        0x0A ArrayNewElem "array.new_elem"
        0x0B ArrayGet "array.get"
        0x0C ArrayGetS "array.get_s"
        0x0D ArrayGetU "array.get_u"
        0x0E ArraySet "array.set"
        0x0F ArrayLen "array.len"
        0x10 ArrayFill "array.fill"
        0x11 ArrayCopy "array.copy"
        0x12 ArrayInitData "array.init_data"
        0x13 ArrayInitElem "array.init_elem"
        0x14 RefTest "ref.test"
        0x15 RefTestNull "ref.test null"
        0x16 RefCast "ref.cast"
        0x17 RefCastNull "ref.cast null"
        0x18 BrOnCast "br_on_cast"
        0x19 BrOnCastFail "br_on_cast_fail"
        0x1A AnyConvertExtern "any.convert_extern"
        0x1B ExternConvertAny "extern.convert_any"
        0x1C RefI31 "ref.i31"
        0x1D I31GetS "i31.get_s"
        0x1E I31GetU "i31.get_u"
    }
    // Internal plane: fused superinstructions and auxiliary records.
    0x0700 => {
        0x00 Aux "aux"
        0x01 LocalGetPair "local.get.pair"
        0x02 LocalGetConst32 "local.get.const32"
        0x03 I32CmpLocals "i32.cmp.locals"
    }
}

#[cfg(test)]
mod tests {
    use super::Op;

    #[test]
    fn packed_round_trip() {
        for op in [
            Op::Unreachable,
            Op::I32Add,
            Op::BrTable,
            Op::I32TruncSatF32S,
            Op::V128Load,
            Op::F64x2ConvertLowI32x4U,
            Op::I64AtomicRmw32CmpxchgU,
            Op::StructNew,
            Op::I31GetU,
            Op::I32CmpLocals,
        ] {
            assert_eq!(Op::from_packed(op.packed()), Some(op), "{}", op.name());
        }
    }

    #[test]
    fn undefined_slots_rejected() {
        // Core 0x06 and 0x07 are unassigned, as is everything past the
        // internal plane.
        assert_eq!(Op::from_packed(0x0006), None);
        assert_eq!(Op::from_packed(0x0007), None);
        assert_eq!(Op::from_packed(0x07ff), None);
        assert_eq!(Op::from_packed(0x029A), None); // vector plane gap
    }

    #[test_case::test_case(Op::I32Add, "i32.add")]
    #[test_case::test_case(Op::MemoryFill, "memory.fill")]
    #[test_case::test_case(Op::I8x16Shuffle, "i8x16.shuffle")]
    #[test_case::test_case(Op::StructNew, "struct.new")]
    fn names_match_planes(op: Op, name: &str) {
        assert_eq!(op.name(), name);
    }
}
