//! 16-bit PCM helpers.
//!
//! PCM16 payloads are mono, little-endian signed samples.

/// Decode little-endian PCM16 bytes into samples. A trailing odd byte is ignored.
pub fn bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}

/// Encode samples as little-endian PCM16 bytes.
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Compute RMS energy of a PCM frame.
pub fn rms(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len() as f64).sqrt()
}

/// Halve every sample of a PCM16 payload (-6 dB).
pub fn attenuate_6db(payload: &[u8]) -> Vec<u8> {
    let samples: Vec<i16> = bytes_to_samples(payload).into_iter().map(|s| s / 2).collect();
    samples_to_bytes(&samples)
}

/// A silent PCM16 payload of `samples` samples.
pub fn silence(samples: usize) -> Vec<u8> {
    vec![0u8; samples * 2]
}

/// A sine tone as PCM16 samples.
pub fn tone(freq_hz: f32, sample_rate: u32, samples: usize, amplitude: i16) -> Vec<i16> {
    let step = std::f32::consts::TAU * freq_hz / sample_rate as f32;
    (0..samples)
        .map(|n| ((n as f32 * step).sin() * amplitude as f32) as i16)
        .collect()
}

/// Linear-interpolation resample of mono PCM16.
pub fn resample_linear(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 || samples.is_empty() {
        return samples.to_vec();
    }
    let out_len = (samples.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let step = from_rate as f64 / to_rate as f64;
    let last = samples.len() - 1;
    (0..out_len)
        .map(|n| {
            let pos = n as f64 * step;
            let i = (pos as usize).min(last);
            let frac = pos - i as f64;
            let a = samples[i] as f64;
            let b = samples[(i + 1).min(last)] as f64;
            (a + (b - a) * frac).round() as i16
        })
        .collect()
}

/// Wrap raw 16-bit PCM in a WAV container.
pub fn pcm_to_wav(pcm: &[i16], sample_rate: u32, channels: u16, bits_per_sample: u16) -> Vec<u8> {
    let data_len = pcm.len() * 2;
    let byte_rate = sample_rate * channels as u32 * bits_per_sample as u32 / 8;
    let block_align = channels * bits_per_sample / 8;
    let file_size = 36 + data_len as u32;

    let mut wav = Vec::with_capacity(44 + data_len);

    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&file_size.to_le_bytes());
    wav.extend_from_slice(b"WAVE");

    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM format
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&bits_per_sample.to_le_bytes());

    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&(data_len as u32).to_le_bytes());
    wav.extend_from_slice(&samples_to_bytes(pcm));

    wav
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rms_calculation() {
        assert_eq!(rms(&[0i16; 320]), 0.0);
        assert!((rms(&[100i16; 320]) - 100.0).abs() < 0.01);
        assert_eq!(rms(&[]), 0.0);
    }

    #[test]
    fn test_sample_bytes_are_little_endian() {
        let bytes = samples_to_bytes(&[1, -2]);
        assert_eq!(bytes, vec![0x01, 0x00, 0xFE, 0xFF]);
        assert_eq!(bytes_to_samples(&bytes), vec![1, -2]);
        assert_eq!(bytes_to_samples(&[0x01, 0x00, 0x07]), vec![1]);
    }

    #[test]
    fn test_attenuate_halves_amplitude() {
        let loud = samples_to_bytes(&[1000, -1000, 7]);
        assert_eq!(bytes_to_samples(&attenuate_6db(&loud)), vec![500, -500, 3]);
    }

    #[test]
    fn test_tone_is_audible() {
        let samples = tone(440.0, 16000, 320, 8000);
        assert_eq!(samples.len(), 320);
        assert!(rms(&samples) > 1000.0);
    }

    #[test]
    fn test_resample_changes_length_and_keeps_shape() {
        let ramp: Vec<i16> = (0..160).map(|n| n * 10).collect();
        let up = resample_linear(&ramp, 8000, 16000);
        assert_eq!(up.len(), 320);
        assert_eq!(up[0], 0);
        assert_eq!(up[2], 10);
        assert_eq!(up[1], 5);

        let down = resample_linear(&ramp, 16000, 8000);
        assert_eq!(down.len(), 80);
        assert_eq!(down[1], 20);

        assert_eq!(resample_linear(&ramp, 16000, 16000), ramp);
    }

    #[test]
    fn test_wav_header_generation() {
        let pcm = vec![0i16; 16000];
        let wav = pcm_to_wav(&pcm, 16000, 1, 16);

        assert_eq!(wav.len(), 44 + 16000 * 2);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(&wav[12..16], b"fmt ");
        assert_eq!(&wav[36..40], b"data");

        let sr = u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]);
        assert_eq!(sr, 16000);
    }
}
