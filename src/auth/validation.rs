use crate::auth::dto::{FieldError, RegisterRequest};

const PASSWORD_TOO_SHORT: &str = "Length must be greater than 3";

/// Length in UTF-16 code units, the unit browser clients count in.
fn client_len(s: &str) -> usize {
    s.encode_utf16().count()
}

/// Checks registration input and reports only the first failing rule.
pub fn validate_register(input: &RegisterRequest) -> Option<FieldError> {
    if client_len(&input.username) <= 2 {
        return Some(FieldError::new("username", "Length must be greater than 2"));
    }
    if input.username.contains('@') {
        return Some(FieldError::new("username", "Cannot include an @"));
    }
    if !input.email.contains('@') {
        return Some(FieldError::new("email", "Email address must be valid"));
    }
    validate_password("password", &input.password)
}

pub fn validate_new_password(password: &str) -> Option<FieldError> {
    validate_password("newPassword", password)
}

fn validate_password(field: &str, password: &str) -> Option<FieldError> {
    (client_len(password) <= 3).then(|| FieldError::new(field, PASSWORD_TOO_SHORT))
}
