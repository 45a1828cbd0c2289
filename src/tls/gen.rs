//! Private key, self-signed certificate and CSR generation.

use std::io;

use rcgen::{
    CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, KeyUsagePurpose, SerialNumber,
};

fn gen_error(err: rcgen::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err.to_string())
}

// The backend cannot emit password-protected PKCS#8.
fn check_password(password: &str) -> io::Result<()> {
    if password.is_empty() {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "encrypted private keys are not supported",
        ))
    }
}

/// Parses an RFC 4514 distinguished name of the common attribute types,
/// e.g. `CN=example.org,O=Example,C=DE`.
fn parse_distinguished_name(input: &str) -> io::Result<DistinguishedName> {
    let mut dn = DistinguishedName::new();
    for part in input.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (key, value) = part.split_once('=').ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("malformed distinguished name component: {}", part),
            )
        })?;
        let ty = match key.trim().to_ascii_uppercase().as_str() {
            "CN" => DnType::CommonName,
            "O" => DnType::OrganizationName,
            "OU" => DnType::OrganizationalUnitName,
            "C" => DnType::CountryName,
            "L" => DnType::LocalityName,
            "ST" => DnType::StateOrProvinceName,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("unsupported distinguished name attribute: {}", other),
                ))
            }
        };
        dn.push(ty, value.trim());
    }
    Ok(dn)
}

fn certificate_params(
    distinguished_name: &str,
    hostnames: &[String],
) -> io::Result<(CertificateParams, KeyPair)> {
    let mut params = CertificateParams::new(hostnames.to_vec()).map_err(gen_error)?;
    params.distinguished_name = parse_distinguished_name(distinguished_name)?;

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::minutes(5);
    params.not_after = now + time::Duration::days(366);

    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.is_ca = IsCa::ExplicitNoCa;

    let mut serial = [0u8; 20];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut serial);
    params.serial_number = Some(SerialNumber::from(serial.to_vec()));

    // ECDSA P-256 with SHA-256.
    let key_pair = KeyPair::generate().map_err(gen_error)?;
    Ok((params, key_pair))
}

/// Creates a new private key and a self-signed certificate.
///
/// The distinguished name must be an RFC 4514 string of the common
/// attribute types. The output pair is in PEM, first the key and second the
/// certificate. The certificate is valid from five minutes in the past
/// until 366 days from now, usable for digital signatures and key
/// encipherment, and carries a random 20 byte serial.
pub fn generate_selfsigned_certificate(
    password: &str,
    distinguished_name: &str,
    hostnames: &[String],
) -> io::Result<(String, String)> {
    check_password(password)?;
    let (params, key_pair) = certificate_params(distinguished_name, hostnames)?;
    let cert = params.self_signed(&key_pair).map_err(gen_error)?;
    Ok((key_pair.serialize_pem(), cert.pem()))
}

/// Creates a new private key and a certificate signing request.
///
/// Same key generation as [`generate_selfsigned_certificate`]. The key is
/// returned in PEM, the CSR in PEM or DER depending on `csr_as_pem`.
pub fn generate_csr(
    password: &str,
    distinguished_name: &str,
    hostnames: &[String],
    csr_as_pem: bool,
) -> io::Result<(String, Vec<u8>)> {
    check_password(password)?;
    let (params, key_pair) = certificate_params(distinguished_name, hostnames)?;
    let csr = params.serialize_request(&key_pair).map_err(gen_error)?;
    let out = if csr_as_pem {
        csr.pem().map_err(gen_error)?.into_bytes()
    } else {
        csr.der().as_ref().to_vec()
    };
    Ok((key_pair.serialize_pem(), out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selfsigned_is_pem() {
        let (key, cert) = generate_selfsigned_certificate(
            "",
            "CN=test.example.org,O=Test",
            &["test.example.org".to_owned()],
        )
        .unwrap();
        assert!(key.contains("PRIVATE KEY"));
        assert!(cert.starts_with("-----BEGIN CERTIFICATE-----"));
    }

    #[test]
    fn password_is_rejected() {
        let err = generate_selfsigned_certificate("secret", "CN=x", &[]).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[test]
    fn csr_der_parses() {
        let (_, csr) =
            generate_csr("", "CN=csr.example.org", &["csr.example.org".to_owned()], false)
                .unwrap();
        // DER SEQUENCE tag.
        assert_eq!(csr[0], 0x30);
    }
}
