use tch::Tensor;

/// Appends a gaussian-perturbed copy of the batch. The labels are repeated
/// so the doubled batch stays aligned. A zero coefficient leaves the batch
/// untouched.
pub fn with_noise(images: &Tensor, labels: &Tensor, noise_coeff: f64) -> (Tensor, Tensor) {
    if noise_coeff == 0.0 {
        return (images.shallow_clone(), labels.shallow_clone());
    }
    let noisy = images + images.randn_like() * noise_coeff;
    (
        Tensor::cat(&[images, &noisy], 0),
        Tensor::cat(&[labels, labels], 0),
    )
}
