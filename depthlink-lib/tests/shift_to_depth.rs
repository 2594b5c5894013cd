use depthlink_lib::codec::SampleMap;
use depthlink_lib::constants::NO_DEPTH_SHIFT;
use depthlink_lib::shift_to_depth::{ShiftToDepthConfig, ShiftToDepthTable};
use depthlink_lib::stream::{InputFormat, OutputMode, StreamConfig};

#[test]
fn inverse_table_points_back_at_the_shift() {
    let table = ShiftToDepthTable::build(&ShiftToDepthConfig::default()).unwrap();
    for (shift, &depth) in table.shift_to_depth().iter().enumerate() {
        if depth == 0 {
            continue;
        }
        let back = table.shift_for_depth(depth).unwrap();
        // Close range packs several shifts into one millimetre; the last one wins
        assert_eq!(table.lookup(back), depth);
        assert!(usize::from(back) >= shift, "depth {depth} maps back to shift {back} below {shift}");
    }
}

#[test]
fn hundred_micron_output_scales_depth() {
    let config = ShiftToDepthConfig::default();
    let mm = ShiftToDepthTable::for_output(OutputMode::Depth1Mm, &config).unwrap();
    let um = ShiftToDepthTable::for_output(OutputMode::Depth100Um, &config).unwrap();

    let shift = (0..mm.shift_count() as u16)
        .find(|&s| (1_000..1_100).contains(&mm.lookup(s)))
        .unwrap();
    let coarse = u32::from(mm.lookup(shift));
    let fine = u32::from(um.lookup(shift));
    assert!(fine.abs_diff(coarse * 10) < 10, "{fine} is not ten times {coarse}");
    assert_eq!(um.depth_to_shift().len(), 65_535);
}

#[test]
fn stream_output_mode_selects_the_map() {
    let calibration = ShiftToDepthConfig::default();

    let shift = StreamConfig::depth(640, 480, InputFormat::Packed11, OutputMode::Shift);
    let map = SampleMap::for_stream(&shift, &calibration).unwrap();
    assert_eq!(map.no_data(), NO_DEPTH_SHIFT);
    assert_eq!(map.map(1_234), 1_234);

    let depth = StreamConfig::depth(640, 480, InputFormat::Packed11, OutputMode::Depth1Mm);
    let map = SampleMap::for_stream(&depth, &calibration).unwrap();
    assert_eq!(map.no_data(), 0);
    assert_eq!(map.map(2_047), 0);

    let ir = StreamConfig::ir(640, 488);
    assert!(matches!(SampleMap::for_stream(&ir, &calibration).unwrap(), SampleMap::Direct));

    let raw = StreamConfig::depth(640, 480, InputFormat::Packed11, OutputMode::Raw);
    assert!(SampleMap::for_stream(&raw, &calibration).is_err());
}
