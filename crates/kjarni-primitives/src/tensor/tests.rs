use super::*;
use crate::error::Status;

#[test]
fn blocked_data_pads_channels() {
    let desc = TensorDesc::new(&[2, 20, 3, 3], DType::BF16, FormatTag::NChw16c).unwrap();
    assert_eq!(desc.padded_dims().unwrap(), vec![2, 32, 3, 3]);
    assert_eq!(desc.nelems(), 2 * 20 * 9);
    assert_eq!(desc.size_bytes(), 2 * 32 * 9 * 2);
}

#[test]
fn blocked_strides_count_blocks() {
    let desc = TensorDesc::new(&[1, 32, 2, 2], DType::F32, FormatTag::NChw16c).unwrap();
    // n, C-block, h, w
    assert_eq!(desc.strides().unwrap(), vec![128, 64, 32, 16]);
}

#[test]
fn channels_last_strides() {
    let desc = TensorDesc::new(&[2, 3, 4, 5], DType::F32, FormatTag::Nhwc).unwrap();
    assert_eq!(desc.strides().unwrap(), vec![60, 1, 15, 3]);
    assert_eq!(desc.size_bytes(), 2 * 3 * 4 * 5 * 4);
}

#[test]
fn weights_tags_pad_both_channel_axes() {
    let desc = TensorDesc::new(&[20, 8, 1, 1], DType::BF16, FormatTag::OIhw8i16o2i).unwrap();
    assert_eq!(desc.padded_dims().unwrap(), vec![32, 16, 1, 1]);
    assert_eq!(desc.size_bytes(), 32 * 16 * 2);
}

#[test]
fn grouped_backward_data_weights_order() {
    let tag = FormatTag::bwd_data_weights(4, true).unwrap();
    assert_eq!(tag, FormatTag::GIOhw8o16i2o);
    assert_eq!(tag.outer_order(), vec![0, 2, 1, 3, 4]);
    assert_eq!(tag.blocks(), vec![(1, 16), (2, 16)]);
}

#[test]
fn default_tags_by_rank() {
    assert_eq!(FormatTag::blocked_data(2), Some(FormatTag::NC16c));
    assert_eq!(FormatTag::blocked_data(3), Some(FormatTag::NCw16c));
    assert_eq!(FormatTag::blocked_data(4), Some(FormatTag::NChw16c));
    assert_eq!(FormatTag::blocked_data(5), Some(FormatTag::NCdhw16c));
    assert_eq!(FormatTag::blocked_data(6), None);
    assert_eq!(FormatTag::fwd_weights(3, false), Some(FormatTag::OIw8i16o2i));
    assert_eq!(FormatTag::bwd_weights_weights(5, true), Some(FormatTag::GOIdhw16i16o));
    assert_eq!(FormatTag::depthwise_weights(4), Some(FormatTag::Goihw16g));
}

#[test]
fn format_rank_mismatch_is_invalid() {
    let err = TensorDesc::new(&[1, 16, 4], DType::F32, FormatTag::NChw16c).unwrap_err();
    assert_eq!(err.kind(), Status::InvalidArguments);
}

#[test]
fn runtime_dims_are_reported() {
    let desc = TensorDesc::with_dims(
        vec![Dim::Known(1), Dim::Runtime, Dim::Known(4), Dim::Known(4)],
        DType::BF16,
        FormatTag::Any,
    )
    .unwrap();
    assert!(desc.has_runtime_dims_or_strides());
    assert_eq!(desc.known_dims(), None);
    assert_eq!(desc.size_bytes(), 0);
}

#[test]
fn runtime_strides_are_reported() {
    let dims = vec![Dim::Known(1), Dim::Known(2), Dim::Known(3)];
    let strides = vec![Dim::Runtime, Dim::Known(3), Dim::Known(1)];
    let desc = TensorDesc::strided(dims, DType::F32, strides).unwrap();
    assert!(desc.has_runtime_dims_or_strides());
    assert_eq!(desc.format(), FormatTag::Ncw);
}

#[test]
fn explicit_strides_drive_size() {
    let dims = vec![Dim::Known(2), Dim::Known(3)];
    let strides = vec![Dim::Known(8), Dim::Known(1)];
    let desc = TensorDesc::strided(dims, DType::F32, strides).unwrap();
    assert_eq!(desc.size_bytes(), (8 + 2 + 1) * 4);
}

#[test]
fn any_has_no_size() {
    let desc = TensorDesc::new(&[1, 16, 4, 4], DType::BF16, FormatTag::Any).unwrap();
    assert_eq!(desc.size_bytes(), 0);
    let concrete = desc.with_format(FormatTag::NChw16c).unwrap();
    assert_eq!(concrete.size_bytes(), 16 * 16 * 2);
    assert_ne!(desc, concrete);
}

#[test]
fn zero_dim_detected() {
    let desc = TensorDesc::new(&[0, 16, 4, 4], DType::BF16, FormatTag::NChw16c).unwrap();
    assert!(desc.has_zero_dim());
    assert_eq!(desc.size_bytes(), 0);
}

#[test]
fn dtype_sizes() {
    assert_eq!(DType::F32.size_of(), 4);
    assert_eq!(DType::BF16.size_of(), 2);
    assert_eq!(DType::S8.size_of(), 1);
    assert_eq!(DType::Undef.size_of(), 0);
    assert_eq!(DType::BF16.to_string(), "bf16");
}
