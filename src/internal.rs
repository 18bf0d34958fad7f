use rand::Rng;

#[cfg(feature = "rayon")]
use rayon::prelude::*;


// Polar Box-Muller transformation

pub fn randn(rng: &mut impl Rng) -> (f32, f32) {
  loop {
    let u: f32 = rng.gen_range(-1.0, 1.0);
    let v: f32 = rng.gen_range(-1.0, 1.0);
    let r = u * u + v * v;
    // Try again if outside interval
    if r == 0.0 || r >= 1.0 { continue }
    let c = (-2.0 * r.ln() / r).sqrt();
    return (u * c, v * c)
  }
}


/// Run `op` over consecutive chunks of `out`, passing each chunk's index.
///
/// Every output value must only depend on its own position, which keeps
/// results identical whether chunks run in parallel or not.

#[cfg(feature = "rayon")]
pub fn chunked<F>(out: &mut [f32], chunk: usize, parallel: bool, op: F)
where
  F: Fn(usize, &mut [f32]) + Send + Sync,
{
  let chunk = chunk.max(1);
  if parallel && out.len() > chunk {
    out.par_chunks_mut(chunk).enumerate().for_each(|(i, c)| op(i, c) );
  } else {
    out.chunks_mut(chunk).enumerate().for_each(|(i, c)| op(i, c) );
  }
}

#[cfg(not(feature = "rayon"))]
pub fn chunked<F>(out: &mut [f32], chunk: usize, _parallel: bool, op: F)
where
  F: Fn(usize, &mut [f32]) + Send + Sync,
{
  out.chunks_mut(chunk.max(1)).enumerate().for_each(|(i, c)| op(i, c) );
}


/// Chunk length for plain elementwise kernels.

pub const CHUNK: usize = 4096;


#[cfg(test)]
mod tests {
  use super::*;
  use rand::{ SeedableRng, rngs::StdRng };

  #[test]
  fn normal_moments() {
    let mut rng = StdRng::seed_from_u64(3);
    let values: Vec<f32> = (0..5000).flat_map(|_| { let (a, b) = randn(&mut rng); [a, b] } ).collect();
    let mean = values.iter().sum::<f32>() / values.len() as f32;
    let var = values.iter().map(|v| (v - mean).powi(2) ).sum::<f32>() / values.len() as f32;
    assert!(mean.abs() < 0.05);
    assert!((var - 1.0).abs() < 0.1);
  }

  #[test]
  fn chunks_cover_output() {
    let mut out = vec![0.0; 10];
    chunked(&mut out, 3, true, |i, c| {
      for (j, v) in c.iter_mut().enumerate() {
        *v = (i * 3 + j) as f32;
      }
    });
    assert_eq!(out, (0..10).map(|i| i as f32 ).collect::<Vec<_>>());
  }
}
