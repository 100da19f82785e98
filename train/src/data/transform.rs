use crate::common::*;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Converts a `[channels, height, width]` byte image to a float image
/// normalized with ImageNet statistics. Channels beyond RGB are dropped.
pub fn normalize_image(image: &Tensor) -> Result<Tensor> {
    let (channels, _, _) = image.size3()?;
    ensure!(
        channels >= 3,
        "expect an RGB image, but get {} channels",
        channels
    );
    let device = image.device();

    let rgb = image.narrow(0, 0, 3).to_kind(Kind::Float) / 255.0;
    let mean = Tensor::of_slice(&IMAGENET_MEAN)
        .view([3, 1, 1])
        .to_device(device);
    let std = Tensor::of_slice(&IMAGENET_STD).view([3, 1, 1]).to_device(device);
    Ok((rgb - mean) / std)
}

/// Loads an image file and resizes it to `[height, width]`. Returns the
/// normalized image and the original `[height, width]`.
pub fn load_image(path: &Path, [height, width]: [i64; 2]) -> Result<(Tensor, [i64; 2])> {
    let image = vision::image::load(path)
        .with_context(|| format!("failed to load image '{}'", path.display()))?;
    let (_, orig_h, orig_w) = image.size3()?;
    let image = if (orig_h, orig_w) == (height, width) {
        image
    } else {
        vision::image::resize(&image, width, height)?
    };
    Ok((normalize_image(&image)?, [orig_h, orig_w]))
}
