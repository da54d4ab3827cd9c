//! Binary acoustic model I/O.
//!
//! The on-disk format follows the repository's `BINHMM` / `BINHMMV2`
//! convention: a header string with optional qualifiers (`_E` embedded
//! analysis parameters, `_V` inverse variances), then the model sections in
//! dependency order — options, mixture-tying flag, transitions, variances,
//! densities, stream weights, states, models. Cross references between
//! sections are serialized as integer indexes in section order. All
//! multi-byte values are big-endian on disk regardless of host order.

use super::{Gaussian, HmmSet, HmmState, MixturePdf, ModelError, PhysicalHmm, TransMatrix};
use crate::config::{AnalysisConfig, FeatureType};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

const HEADER_V1: &str = "BINHMM";
const HEADER_V2: &str = "BINHMMV2";
const QUAL_EMBED_PARA: char = 'E';
const QUAL_VAR_INVERSED: char = 'V';
const QUAL_MPDF_MACRO: char = 'M';

/// Sentinel index marking a non-emitting (entry/exit) state slot.
const STATE_NONE: u32 = u32::MAX;

const PARA_VERSION: i16 = 1;

fn write_str(w: &mut impl Write, s: &str) -> std::io::Result<()> {
    w.write_all(s.as_bytes())?;
    w.write_u8(0)
}

fn read_str(r: &mut impl Read) -> Result<String, ModelError> {
    let mut bytes = Vec::new();
    loop {
        let b = r.read_u8()?;
        if b == 0 {
            break;
        }
        bytes.push(b);
        if bytes.len() > 4096 {
            return Err(ModelError::Format("unterminated string in model".into()));
        }
    }
    String::from_utf8(bytes).map_err(|_| ModelError::Format("non-UTF8 string in model".into()))
}

fn write_para(w: &mut impl Write, para: &AnalysisConfig) -> std::io::Result<()> {
    w.write_i16::<BigEndian>(PARA_VERSION)?;
    w.write_u32::<BigEndian>(para.sample_freq)?;
    w.write_u32::<BigEndian>(para.frame_size as u32)?;
    w.write_u32::<BigEndian>(para.frame_shift as u32)?;
    let base = match para.base_type {
        FeatureType::Mfcc => 0i16,
        FeatureType::Fbank => 1,
        FeatureType::MelSpec => 2,
    };
    w.write_i16::<BigEndian>(base)?;
    let mut flags = 0u8;
    for (bit, on) in [
        para.delta,
        para.accel,
        para.energy,
        para.c0,
        para.raw_e,
        para.abs_energy_suppressed,
        para.cmn,
        para.cvn,
    ]
    .iter()
    .enumerate()
    {
        if *on {
            flags |= 1 << bit;
        }
    }
    w.write_u8(flags)?;
    w.write_u16::<BigEndian>(para.fbank_num as u16)?;
    w.write_u16::<BigEndian>(para.mfcc_dim as u16)?;
    w.write_u16::<BigEndian>(para.lifter as u16)?;
    w.write_u16::<BigEndian>(para.delta_win as u16)?;
    w.write_u16::<BigEndian>(para.accel_win as u16)?;
    w.write_f32::<BigEndian>(para.pre_emph)
}

fn read_para(r: &mut impl Read) -> Result<AnalysisConfig, ModelError> {
    let version = r.read_i16::<BigEndian>()?;
    if version > PARA_VERSION {
        return Err(ModelError::Format(format!(
            "unknown embedded parameter format version: {}",
            version
        )));
    }
    let mut para = AnalysisConfig::default();
    para.sample_freq = r.read_u32::<BigEndian>()?;
    para.frame_size = r.read_u32::<BigEndian>()? as usize;
    para.frame_shift = r.read_u32::<BigEndian>()? as usize;
    para.base_type = match r.read_i16::<BigEndian>()? {
        0 => FeatureType::Mfcc,
        1 => FeatureType::Fbank,
        2 => FeatureType::MelSpec,
        other => {
            return Err(ModelError::Format(format!(
                "unknown embedded feature type code: {}",
                other
            )))
        }
    };
    let flags = r.read_u8()?;
    para.delta = flags & (1 << 0) != 0;
    para.accel = flags & (1 << 1) != 0;
    para.energy = flags & (1 << 2) != 0;
    para.c0 = flags & (1 << 3) != 0;
    para.raw_e = flags & (1 << 4) != 0;
    para.abs_energy_suppressed = flags & (1 << 5) != 0;
    para.cmn = flags & (1 << 6) != 0;
    para.cvn = flags & (1 << 7) != 0;
    para.fbank_num = r.read_u16::<BigEndian>()? as usize;
    para.mfcc_dim = r.read_u16::<BigEndian>()? as usize;
    para.lifter = r.read_u16::<BigEndian>()? as usize;
    para.delta_win = r.read_u16::<BigEndian>()? as usize;
    para.accel_win = r.read_u16::<BigEndian>()? as usize;
    para.pre_emph = r.read_f32::<BigEndian>()?;
    Ok(para)
}

/// Write an [`HmmSet`] in BINHMMV2 format.
pub fn write_binhmm(w: &mut impl Write, set: &HmmSet) -> Result<(), ModelError> {
    let mut header = String::from(HEADER_V2);
    // in-memory variances are always inverted
    header.push('_');
    header.push(QUAL_VAR_INVERSED);
    if set.embedded_analysis.is_some() {
        header.push('_');
        header.push(QUAL_EMBED_PARA);
    }
    write_str(w, &header)?;
    if let Some(para) = &set.embedded_analysis {
        write_para(w, para)?;
    }

    // options
    w.write_i16::<BigEndian>(set.stream_sizes.len() as i16)?;
    for &sz in &set.stream_sizes {
        w.write_i16::<BigEndian>(sz as i16)?;
    }
    w.write_i16::<BigEndian>(set.vec_len as i16)?;
    w.write_i16::<BigEndian>(set.cov_type)?;
    w.write_i16::<BigEndian>(set.dur_type)?;
    w.write_i16::<BigEndian>(set.param_type)?;

    // mixture tying
    w.write_u8(0)?;
    let maxmix = set
        .states
        .iter()
        .flat_map(|s| s.streams.iter().map(|p| p.len()))
        .max()
        .unwrap_or(0);
    w.write_i32::<BigEndian>(maxmix as i32)?;

    // transitions
    w.write_u32::<BigEndian>(set.trans.len() as u32)?;
    for t in &set.trans {
        write_str(w, "")?;
        w.write_i16::<BigEndian>(t.nstate as i16)?;
        for from in 0..t.nstate {
            for to in 0..t.nstate {
                w.write_f32::<BigEndian>(t.get(from, to))?;
            }
        }
    }

    // variances, one entry per density
    w.write_u32::<BigEndian>(set.dens.len() as u32)?;
    for d in &set.dens {
        write_str(w, "")?;
        w.write_i16::<BigEndian>(d.inv_var.len() as i16)?;
        for &v in &d.inv_var {
            w.write_f32::<BigEndian>(v)?;
        }
    }

    // densities
    w.write_u32::<BigEndian>(set.dens.len() as u32)?;
    for (idx, d) in set.dens.iter().enumerate() {
        write_str(w, "")?;
        w.write_i16::<BigEndian>(d.mean.len() as i16)?;
        for &m in &d.mean {
            w.write_f32::<BigEndian>(m)?;
        }
        w.write_u32::<BigEndian>(idx as u32)?;
        w.write_f32::<BigEndian>(d.gconst)?;
    }

    // stream weights (only in multi-stream models)
    if set.stream_sizes.len() > 1 {
        w.write_u32::<BigEndian>(set.states.len() as u32)?;
        for s in &set.states {
            write_str(w, "")?;
            w.write_i16::<BigEndian>(s.stream_weights.len() as i16)?;
            for &sw in &s.stream_weights {
                w.write_f32::<BigEndian>(sw)?;
            }
        }
    }

    // states with inline mixture pdfs
    w.write_u32::<BigEndian>(set.states.len() as u32)?;
    for (idx, s) in set.states.iter().enumerate() {
        write_str(w, "")?;
        for pdf in &s.streams {
            w.write_i16::<BigEndian>(pdf.len() as i16)?;
            for &d in &pdf.dens {
                w.write_u32::<BigEndian>(d)?;
            }
            for &wt in &pdf.weights {
                w.write_f32::<BigEndian>(wt)?;
            }
        }
        if set.stream_sizes.len() > 1 {
            w.write_u32::<BigEndian>(idx as u32)?;
        }
    }

    // models
    w.write_u32::<BigEndian>(set.physical.len() as u32)?;
    for m in &set.physical {
        write_str(w, &m.name)?;
        w.write_i16::<BigEndian>((m.states.len() + 2) as i16)?;
        w.write_u32::<BigEndian>(STATE_NONE)?;
        for &s in &m.states {
            w.write_u32::<BigEndian>(s)?;
        }
        w.write_u32::<BigEndian>(STATE_NONE)?;
        w.write_u32::<BigEndian>(m.trans)?;
    }

    Ok(())
}

/// Read a BINHMM/BINHMMV2 model file.
pub fn read_binhmm(r: &mut impl Read) -> Result<HmmSet, ModelError> {
    let header = read_str(r)?;
    let mut variance_inversed = false;
    let mut embed_para = false;
    if header == HEADER_V1 {
        // plain variances, no qualifiers
    } else if let Some(quals) = header.strip_prefix(HEADER_V2) {
        for q in quals.split('_').filter(|q| !q.is_empty()) {
            let mut chars = q.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) if c == QUAL_VAR_INVERSED => variance_inversed = true,
                (Some(c), None) if c == QUAL_EMBED_PARA => embed_para = true,
                (Some(c), None) if c == QUAL_MPDF_MACRO => {
                    return Err(ModelError::Unsupported(
                        "mixture PDF macros are not supported".into(),
                    ))
                }
                _ => {
                    return Err(ModelError::Format(format!(
                        "unknown format qualifier in header: \"{}\"",
                        q
                    )))
                }
            }
        }
    } else {
        return Err(ModelError::Format("not a binary HMM file".into()));
    }

    let embedded_analysis = if embed_para {
        Some(read_para(r)?)
    } else {
        None
    };

    // options
    let nstream = r.read_i16::<BigEndian>()?;
    if nstream <= 0 {
        return Err(ModelError::Format("invalid stream count".into()));
    }
    let mut stream_sizes = Vec::with_capacity(nstream as usize);
    for _ in 0..nstream {
        stream_sizes.push(r.read_i16::<BigEndian>()? as usize);
    }
    let vec_len = r.read_i16::<BigEndian>()? as usize;
    let cov_type = r.read_i16::<BigEndian>()?;
    let dur_type = r.read_i16::<BigEndian>()?;
    let param_type = r.read_i16::<BigEndian>()?;

    // mixture tying
    let tied = r.read_u8()?;
    if tied != 0 {
        return Err(ModelError::Unsupported(
            "tied-mixture models are not supported".into(),
        ));
    }
    let _maxmix = r.read_i32::<BigEndian>()?;

    let mut set = HmmSet::new(vec_len);
    set.stream_sizes = stream_sizes;
    set.cov_type = cov_type;
    set.dur_type = dur_type;
    set.param_type = param_type;
    set.embedded_analysis = embedded_analysis;

    // transitions
    let tr_num = r.read_u32::<BigEndian>()?;
    for _ in 0..tr_num {
        let _name = read_str(r)?;
        let nstate = r.read_i16::<BigEndian>()? as usize;
        let mut t = TransMatrix::new(nstate);
        for from in 0..nstate {
            for to in 0..nstate {
                t.set(from, to, r.read_f32::<BigEndian>()?);
            }
        }
        set.trans.push(t);
    }

    // variances
    let vr_num = r.read_u32::<BigEndian>()?;
    let mut variances: Vec<Vec<f32>> = Vec::with_capacity(vr_num as usize);
    for _ in 0..vr_num {
        let _name = read_str(r)?;
        let len = r.read_i16::<BigEndian>()? as usize;
        let mut v = Vec::with_capacity(len);
        for _ in 0..len {
            v.push(r.read_f32::<BigEndian>()?);
        }
        variances.push(v);
    }

    // densities
    let dens_num = r.read_u32::<BigEndian>()?;
    for _ in 0..dens_num {
        let _name = read_str(r)?;
        let meanlen = r.read_i16::<BigEndian>()? as usize;
        let mut mean = Vec::with_capacity(meanlen);
        for _ in 0..meanlen {
            mean.push(r.read_f32::<BigEndian>()?);
        }
        let vid = r.read_u32::<BigEndian>()? as usize;
        let gconst = r.read_f32::<BigEndian>()?;
        let var = variances.get(vid).ok_or_else(|| {
            ModelError::UndefinedReference(format!("variance id {} out of range", vid))
        })?;
        let inv_var = if variance_inversed {
            var.clone()
        } else {
            var.iter().map(|v| 1.0 / v).collect()
        };
        set.dens.push(Gaussian {
            mean,
            inv_var,
            gconst,
        });
    }

    // stream weights
    let mut stream_weights: Vec<Vec<f32>> = Vec::new();
    if set.stream_sizes.len() > 1 {
        let sw_num = r.read_u32::<BigEndian>()?;
        for _ in 0..sw_num {
            let _name = read_str(r)?;
            let len = r.read_i16::<BigEndian>()? as usize;
            let mut v = Vec::with_capacity(len);
            for _ in 0..len {
                v.push(r.read_f32::<BigEndian>()?);
            }
            stream_weights.push(v);
        }
    }

    // states
    let st_num = r.read_u32::<BigEndian>()?;
    for _ in 0..st_num {
        let _name = read_str(r)?;
        let mut streams = Vec::with_capacity(set.stream_sizes.len());
        for _ in 0..set.stream_sizes.len() {
            let mix_num = r.read_i16::<BigEndian>()?;
            if mix_num < 0 {
                return Err(ModelError::Unsupported(
                    "tied-mixture pdf reference in state".into(),
                ));
            }
            let mut dens = Vec::with_capacity(mix_num as usize);
            for _ in 0..mix_num {
                let did = r.read_u32::<BigEndian>()?;
                if did as usize >= set.dens.len() {
                    return Err(ModelError::UndefinedReference(format!(
                        "density id {} out of range",
                        did
                    )));
                }
                dens.push(did);
            }
            let mut weights = Vec::with_capacity(mix_num as usize);
            for _ in 0..mix_num {
                weights.push(r.read_f32::<BigEndian>()?);
            }
            streams.push(MixturePdf { weights, dens });
        }
        let sw = if set.stream_sizes.len() > 1 {
            let swid = r.read_u32::<BigEndian>()? as usize;
            stream_weights
                .get(swid)
                .cloned()
                .unwrap_or_else(|| vec![1.0; set.stream_sizes.len()])
        } else {
            vec![1.0]
        };
        set.states.push(HmmState {
            streams,
            stream_weights: sw,
        });
    }

    // models
    let md_num = r.read_u32::<BigEndian>()?;
    for _ in 0..md_num {
        let name = read_str(r)?;
        let state_num = r.read_i16::<BigEndian>()? as usize;
        let mut states = Vec::new();
        for _ in 0..state_num {
            let sid = r.read_u32::<BigEndian>()?;
            if sid != STATE_NONE {
                if sid as usize >= set.states.len() {
                    return Err(ModelError::UndefinedReference(format!(
                        "model {}: state id {} out of range",
                        name, sid
                    )));
                }
                states.push(sid);
            }
        }
        let tid = r.read_u32::<BigEndian>()?;
        if tid as usize >= set.trans.len() {
            return Err(ModelError::UndefinedReference(format!(
                "model {}: transition id {} out of range",
                name, tid
            )));
        }
        let tm = &set.trans[tid as usize];
        let multipath = tm.is_multipath();
        if tm.nstate != states.len() + 2 {
            return Err(ModelError::Format(format!(
                "model {}: transition size {} does not match {} emitting states",
                name,
                tm.nstate,
                states.len()
            )));
        }
        let id = set.physical.len() as u32;
        set.physical.push(PhysicalHmm {
            name: name.clone(),
            states,
            trans: tid,
            multipath,
        });
        set.register_physical_name(&name, id);
    }

    set.check()?;
    log::info!(
        "binhmm: {} models, {} states, {} densities read",
        set.physical.len(),
        set.states.len(),
        set.dens.len()
    );
    Ok(set)
}

/// Fill arcs of a left-to-right transition matrix with uniform
/// self/advance probabilities. Test and tooling helper.
pub fn left_to_right_trans(num_emitting: usize, self_prob: f32) -> TransMatrix {
    let n = num_emitting + 2;
    let mut t = TransMatrix::new(n);
    t.set(0, 1, 0.0);
    for i in 1..=num_emitting {
        t.set(i, i, self_prob.ln());
        t.set(i, i + 1, (1.0 - self_prob).ln());
    }
    t
}
