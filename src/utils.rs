use indicatif::ProgressStyle;

pub fn pb_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "[{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({per_sec}, 剩余 {eta}) {msg}",
    )
    .expect("failed to build progress style")
    .progress_chars("#>-")
}
